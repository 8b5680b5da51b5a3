//! Per-method access-type gates.

use tessera_core::access::AccessType;

use crate::AccessLogic;

/// Method families only a personal token may call.
const PERSONAL_ONLY_PREFIXES: &[&str] = &["account.", "followedSlices.", "profile."];
const PERSONAL_ONLY_METHODS: &[&str] = &["accesses.checkApp"];

/// Methods a shared access may not call.
const NON_SHARED_METHODS: &[&str] = &["accesses.get", "accesses.create"];

/// Methods a personal token may not call.
const NON_PERSONAL_METHODS: &[&str] = &["webhooks.create"];

impl AccessLogic {
    /// Whether the access's type allows calling the method at all;
    /// permission checks within the method still apply.
    pub fn can_call(&self, method_id: &str) -> bool {
        let personal_only = PERSONAL_ONLY_METHODS.contains(&method_id)
            || PERSONAL_ONLY_PREFIXES
                .iter()
                .any(|prefix| method_id.starts_with(prefix));

        match self.access.access_type {
            AccessType::Personal => !NON_PERSONAL_METHODS.contains(&method_id),
            AccessType::App => !personal_only,
            AccessType::Shared => {
                !personal_only && !NON_SHARED_METHODS.contains(&method_id)
            }
        }
    }
}
