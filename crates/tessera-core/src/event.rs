//! The event data model.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::Timestamp;
use crate::id::EventId;
use crate::stream::StreamId;

/// A timestamped typed fact attached to one or more streams.
///
/// A record with `head_id == None` is the live event; a record with
/// `head_id == Some(id)` is a frozen previous version of the event `id`.
/// A record with `deleted == Some(ts)` is a tombstone: only `id` and
/// `deleted` remain meaningful.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: EventId,
    /// Ordered, duplicate-free, non-empty (except in tombstones).
    pub stream_ids: Vec<StreamId>,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<serde_json::Value>,
    pub time: Timestamp,
    /// `None` means "still running". Always serialized, unlike other
    /// nullable fields, so clients can distinguish running from finished.
    #[serde(default)]
    pub end_time: Option<Timestamp>,
    pub created: Timestamp,
    pub created_by: String,
    pub modified: Timestamp,
    pub modified_by: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub trashed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_id: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    pub file_name: String,
    #[serde(rename = "type")]
    pub mime_type: String,
    pub size: u64,
    pub read_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
}

/// `^[a-z0-9-]+/[a-z0-9-]+$`, optionally wrapped as `series:<leaf>`.
pub fn is_valid_event_type(event_type: &str) -> bool {
    let leaf = event_type.strip_prefix("series:").unwrap_or(event_type);
    let Some((class, format)) = leaf.split_once('/') else {
        return false;
    };
    let ok = |s: &str| {
        !s.is_empty()
            && s.bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    };
    ok(class) && ok(format)
}

impl Event {
    /// Structural invariants every non-tombstone event satisfies.
    pub fn check_well_formed(&self) -> Result<(), String> {
        if self.deleted.is_some() {
            return Ok(());
        }
        if self.stream_ids.is_empty() {
            return Err("event must reference at least one stream".into());
        }
        let mut seen = HashSet::new();
        for id in &self.stream_ids {
            if !seen.insert(id) {
                return Err(format!("duplicate stream id `{id}`"));
            }
        }
        if !is_valid_event_type(&self.event_type) {
            return Err(format!("malformed event type `{}`", self.event_type));
        }
        if let Some(end_time) = self.end_time {
            if end_time.is_before(self.time) {
                return Err("endTime must not precede time".into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_event() -> Event {
        Event {
            id: EventId::generate(),
            stream_ids: vec![StreamId::from("diary")],
            event_type: "note/txt".into(),
            content: Some(serde_json::json!("hello")),
            time: Timestamp::from_secs(100.0),
            end_time: None,
            created: Timestamp::from_secs(100.0),
            created_by: "test".into(),
            modified: Timestamp::from_secs(100.0),
            modified_by: "test".into(),
            trashed: false,
            deleted: None,
            head_id: None,
            integrity: None,
            attachments: vec![],
            description: None,
            client_data: None,
        }
    }

    #[test]
    fn type_format() {
        assert!(is_valid_event_type("note/txt"));
        assert!(is_valid_event_type("mass/kg"));
        assert!(is_valid_event_type("series:mass/kg"));
        assert!(!is_valid_event_type("note"));
        assert!(!is_valid_event_type("Note/txt"));
        assert!(!is_valid_event_type("note/"));
        assert!(!is_valid_event_type("/txt"));
    }

    #[test]
    fn well_formedness() {
        let ev = base_event();
        assert!(ev.check_well_formed().is_ok());

        let mut dup = ev.clone();
        dup.stream_ids = vec![StreamId::from("a"), StreamId::from("a")];
        assert!(dup.check_well_formed().is_err());

        let mut backwards = ev.clone();
        backwards.end_time = Some(Timestamp::from_secs(50.0));
        assert!(backwards.check_well_formed().is_err());

        let mut running = ev.clone();
        running.end_time = None;
        assert!(running.check_well_formed().is_ok());
    }

    #[test]
    fn serde_shape() {
        let ev = base_event();
        let v = serde_json::to_value(&ev).unwrap();
        // endTime is always present, even when null
        assert!(v.as_object().unwrap().contains_key("endTime"));
        // absent nullables are dropped
        assert!(!v.as_object().unwrap().contains_key("headId"));
        assert!(!v.as_object().unwrap().contains_key("trashed"));
        assert_eq!(v["type"], "note/txt");
    }
}
