//! Uniqueness-collision sanitisation.

use std::collections::BTreeMap;

use tracing::warn;

use crate::LOG_TARGET;

/// Keep only conflict entries whose value was actually submitted in this
/// request (or matches the current username). Anything else would leak
/// another user's values and is dropped as an operator-visible anomaly.
pub fn sanitize_conflicts(
    reported: &serde_json::Value,
    submitted: &BTreeMap<String, serde_json::Value>,
    username: &str,
) -> serde_json::Map<String, serde_json::Value> {
    let mut kept = serde_json::Map::new();
    let Some(reported) = reported.as_object() else {
        return kept;
    };

    for (field, value) in reported {
        let matches_submission = if field == "username" {
            value.as_str() == Some(username)
        } else {
            submitted.get(field) == Some(value)
        };

        if matches_submission {
            kept.insert(field.clone(), value.clone());
        } else {
            warn!(
                target: LOG_TARGET,
                field,
                "Register reported a conflict on a value this request never sent; dropping"
            );
        }
    }
    kept
}
