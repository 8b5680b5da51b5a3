//! Stream identifiers.
//!
//! Stream ids are plain strings with two special syntaxes:
//!
//! - a store prefix `:<storeId>:<rest>` routes the id to a named data store;
//!   ids without a prefix belong to the `local` store. System streams use the
//!   reserved `:_system:` prefix (built-in) or `:system:` (customer-added).
//! - dotted ids (`.active`, `.unique`) are marker streams attached to account
//!   events; they never get a store prefix.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Store id owning unprefixed stream ids.
pub const LOCAL_STORE: &str = "local";

/// Store prefix of built-in system streams.
pub const RESERVED_PREFIX: &str = ":_system:";

/// Store prefix of customer-added system streams.
pub const CUSTOMER_PREFIX: &str = ":system:";

/// Marker carried by the authoritative event of a unique/indexed account
/// stream.
pub const ACTIVE_MARKER: &str = ".active";

/// Marker carried by events on unique account streams.
pub const UNIQUE_MARKER: &str = ".unique";

#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_marker(&self) -> bool {
        self.0.starts_with('.')
    }

    pub fn is_system(&self) -> bool {
        self.0.starts_with(RESERVED_PREFIX) || self.0.starts_with(CUSTOMER_PREFIX)
    }

    /// Split a `:<storeId>:<rest>` id into its store and the store-local id.
    /// Unprefixed ids (including markers) belong to [`LOCAL_STORE`].
    pub fn split_store(&self) -> (&str, &str) {
        if let Some(rest) = self.0.strip_prefix(':') {
            if let Some((store, local)) = rest.split_once(':') {
                if !store.is_empty() && !local.is_empty() {
                    return (store, local);
                }
            }
        }
        (LOCAL_STORE, &self.0)
    }

    /// Store-local part of the id; the whole id for unprefixed streams.
    pub fn local_part(&self) -> &str {
        self.split_store().1
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for StreamId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Add a system prefix unless the id already carries one (or is a marker).
/// Applying it twice never double-prefixes.
pub fn ensure_prefixed(id: &str, reserved: bool) -> String {
    if id.starts_with(':') || id.starts_with('.') {
        return id.to_owned();
    }
    let prefix = if reserved {
        RESERVED_PREFIX
    } else {
        CUSTOMER_PREFIX
    };
    format!("{prefix}{id}")
}

/// Strip either system prefix, returning the bare name.
pub fn strip_system_prefix(id: &str) -> &str {
    id.strip_prefix(RESERVED_PREFIX)
        .or_else(|| id.strip_prefix(CUSTOMER_PREFIX))
        .unwrap_or(id)
}

/// Translate the legacy dotted form (`.email`) to the reserved prefixed form.
/// Only used on reads, behind a config flag.
pub fn from_legacy_dotted(id: &str) -> Option<String> {
    let name = id.strip_prefix('.')?;
    if name.is_empty() || name.starts_with('.') {
        return None;
    }
    Some(format!("{RESERVED_PREFIX}{name}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixing_is_idempotent() {
        assert_eq!(ensure_prefixed("email", true), ":_system:email");
        assert_eq!(ensure_prefixed(":_system:email", true), ":_system:email");
        assert_eq!(ensure_prefixed("phone", false), ":system:phone");
        assert_eq!(ensure_prefixed(":system:phone", false), ":system:phone");
        assert_eq!(ensure_prefixed(".active", true), ".active");
    }

    #[test]
    fn store_split() {
        let id = StreamId::from(":_system:email");
        assert_eq!(id.split_store(), ("_system", "email"));

        let id = StreamId::from("diary");
        assert_eq!(id.split_store(), (LOCAL_STORE, "diary"));

        let id = StreamId::from(".active");
        assert_eq!(id.split_store(), (LOCAL_STORE, ".active"));

        let id = StreamId::from(":_audit:access-c123");
        assert_eq!(id.split_store(), ("_audit", "access-c123"));
    }

    #[test]
    fn legacy_dotted_reads() {
        assert_eq!(
            from_legacy_dotted(".email").as_deref(),
            Some(":_system:email")
        );
        assert_eq!(from_legacy_dotted("email"), None);
        assert_eq!(from_legacy_dotted(".."), None);
    }
}
