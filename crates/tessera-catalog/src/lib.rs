//! The system-streams catalogue.
//!
//! Built once at startup from the built-in definitions plus the operator's
//! custom stream config, validated, then immutable for the process lifetime.
//! User-account attributes (username, email, language, …) are not rows in a
//! users table: each is the content of an event on one of these reserved
//! streams. The catalogue decides, per stream, whether values are indexed on
//! the service-register, unique across the cluster, visible to clients,
//! editable after registration, and required at registration.
//!
//! # Id prefixes
//!
//! Built-in stream ids carry the `:_system:` store prefix, customer-added
//! ones `:system:`. Prefixing is idempotent: an already-prefixed or dotted
//! (marker) id is never prefixed again. Marker streams (`.active`,
//! `.unique`) keep their dotted ids.
//!
//! # Validation
//!
//! Any violation aborts the build; the operator shell treats that as fatal
//! and refuses to serve.

mod build;
mod queries;

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use snafu::Snafu;
use tessera_core::Timestamp;
use tessera_core::config::CustomStreamsConfig;

pub use self::build::Catalogue;

/// Who created the built-in definitions.
pub const SYSTEM_AUTHOR: &str = "system";

/// Id of the reserved account root (children are account attributes).
pub const ACCOUNT_ROOT: &str = ":_system:account";

/// Id of the helpers root (children are the marker streams).
pub const HELPERS_ROOT: &str = ":_system:helpers";

/// Id of the root for customer streams without account semantics.
pub const OTHER_ROOT: &str = ":_system:other";

/// One node of the built catalogue.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStream {
    /// Prefixed id (or dotted, for markers).
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub parent_id: Option<String>,
    pub children: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    pub is_indexed: bool,
    pub is_unique: bool,
    pub is_shown: bool,
    pub is_editable: bool,
    pub is_required_in_validation: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regex_validation: Option<String>,
    pub created: Timestamp,
    pub created_by: String,
    pub modified: Timestamp,
    pub modified_by: String,
}

impl SystemStream {
    /// Bare name, without either store prefix.
    pub fn unprefixed_id(&self) -> &str {
        tessera_core::stream::strip_system_prefix(&self.id)
    }
}

#[derive(Debug, Snafu)]
pub enum CatalogError {
    #[snafu(display("Stream id `{id}` is too short (2 characters minimum)"))]
    IdTooShort { id: String },

    #[snafu(display("Stream `{id}` has malformed type `{event_type}`"))]
    MalformedType { id: String, event_type: String },

    #[snafu(display("Stream `{id}` is unique but not indexed"))]
    UniqueNotIndexed { id: String },

    #[snafu(display("Duplicate system stream id `{id}`"))]
    DuplicateId { id: String },

    #[snafu(display(
        "Custom stream `{id}` under `other` must be {constraint}"
    ))]
    OtherStreamConstraint { id: String, constraint: &'static str },
}

pub type CatalogResult<T> = std::result::Result<T, CatalogError>;

/// Violations of the account event shape: exactly one account leaf,
/// accompanied only by marker streams.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum AccountShapeError {
    #[snafu(display("An event can reference at most one account stream"))]
    MultipleAccountLeaves,

    #[snafu(display("An account event cannot also reference `{id}`"))]
    MixedWithOtherStreams { id: String },

    #[snafu(display("Events cannot be attached to `{id}` directly"))]
    NotAnAccountLeaf { id: String },
}

/// Inputs for one catalogue build.
#[derive(Debug, Default, Clone)]
pub struct CatalogueOptions {
    pub custom: CustomStreamsConfig,
    /// Also reject bare-name duplicates across prefixes, so legacy dotted
    /// reads stay unambiguous.
    pub backward_compatibility_prefix: bool,
    /// Accept the legacy `.name` id form on reads.
    pub legacy_dotted_reads: bool,
}

/// Derived read-only sets, computed once after the tree is wired.
#[derive(Debug, Default)]
pub(crate) struct Derived {
    pub readable: BTreeMap<String, usize>,
    pub editable: BTreeMap<String, usize>,
    pub all_account: BTreeMap<String, usize>,
    pub indexed_unprefixed: Vec<String>,
    pub unique_unprefixed: Vec<String>,
    pub forbidden_read: HashSet<String>,
    pub forbidden_edit: HashSet<String>,
    pub leaves: Vec<String>,
    pub account_roots_requiring_read: Vec<String>,
}

#[cfg(test)]
mod tests;
