//! Accesses: capability tokens with fine-grained permissions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::Timestamp;
use crate::id::AccessId;
use crate::stream::StreamId;

/// Permission levels, totally ordered by [`PermissionLevel::rank`].
///
/// `CreateOnly` is a pseudo-level: it ranks with `Contribute` but only
/// allows event creation, never reading or updating. Level comparisons must
/// therefore always go through `rank` plus an explicit create-only check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionLevel {
    None,
    Read,
    CreateOnly,
    Contribute,
    Manage,
}

impl PermissionLevel {
    pub fn rank(self) -> i8 {
        match self {
            PermissionLevel::None => -1,
            PermissionLevel::Read => 0,
            PermissionLevel::CreateOnly | PermissionLevel::Contribute => 1,
            PermissionLevel::Manage => 2,
        }
    }

    pub fn at_least(self, other: PermissionLevel) -> bool {
        other.rank() <= self.rank()
    }

    /// Whether a sub-access granted `self` stays within what `other` holds.
    /// `create-only` may not be delegated at all.
    pub fn delegable_from(self, other: PermissionLevel) -> bool {
        if matches!(other, PermissionLevel::CreateOnly) {
            return false;
        }
        self.rank() <= other.rank()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FeatureKind {
    SelfRevoke,
    SelfAudit,
    ForcedStreams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FeatureSetting {
    Allowed,
    Forbidden,
}

/// One capability record. The wire shape is one of:
/// `{streamId, level}`, `{tag, level}`,
/// `{feature: selfRevoke|selfAudit, setting}` or
/// `{feature: forcedStreams, streams}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged, rename_all = "camelCase")]
pub enum Permission {
    Stream {
        #[serde(rename = "streamId")]
        stream_id: StreamId,
        level: PermissionLevel,
    },
    Tag {
        tag: String,
        level: PermissionLevel,
    },
    Feature {
        feature: FeatureKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        setting: Option<FeatureSetting>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        streams: Option<Vec<StreamId>>,
    },
}

impl Permission {
    /// Feature records must carry the field matching their kind.
    pub fn check_well_formed(&self) -> Result<(), String> {
        match self {
            Permission::Stream { .. } | Permission::Tag { .. } => Ok(()),
            Permission::Feature {
                feature,
                setting,
                streams,
            } => match feature {
                FeatureKind::SelfRevoke | FeatureKind::SelfAudit => {
                    if setting.is_none() || streams.is_some() {
                        return Err(format!("feature {feature:?} requires `setting` only"));
                    }
                    Ok(())
                }
                FeatureKind::ForcedStreams => {
                    if streams.is_none() || setting.is_some() {
                        return Err("feature forcedStreams requires `streams` only".into());
                    }
                    Ok(())
                }
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AccessType {
    Personal,
    App,
    Shared,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Access {
    pub id: AccessId,
    /// `None` only on deleted accesses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(rename = "type")]
    pub access_type: AccessType,
    pub name: String,
    /// Only app accesses carry a device name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    /// Per-method call counters, maintained by the method context.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub calls: BTreeMap<String, u64>,
    pub created: Timestamp,
    pub created_by: String,
    pub modified: Timestamp,
    pub modified_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
}

impl Access {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires.is_some_and(|expires| expires.is_before(now))
    }

    /// Uniqueness key among non-deleted accesses.
    pub fn identity_key(&self) -> (String, AccessType, Option<String>) {
        (
            self.name.clone(),
            self.access_type,
            self.device_name.clone(),
        )
    }

    pub fn feature_setting(&self, kind: FeatureKind) -> Option<FeatureSetting> {
        self.permissions.iter().find_map(|p| match p {
            Permission::Feature {
                feature, setting, ..
            } if *feature == kind => *setting,
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_order() {
        use PermissionLevel::*;
        assert!(Read.at_least(None));
        assert!(Contribute.at_least(Read));
        assert!(Manage.at_least(Contribute));
        assert!(CreateOnly.at_least(Contribute));
        assert!(Contribute.at_least(CreateOnly));
        assert!(!Read.at_least(Contribute));
    }

    #[test]
    fn create_only_is_not_delegable() {
        use PermissionLevel::*;
        assert!(Read.delegable_from(Contribute));
        assert!(!Manage.delegable_from(Contribute));
        assert!(!Read.delegable_from(CreateOnly));
        assert!(!CreateOnly.delegable_from(CreateOnly));
    }

    #[test]
    fn permission_wire_shapes() {
        let p: Permission =
            serde_json::from_str(r#"{"streamId": "diary", "level": "create-only"}"#).unwrap();
        assert_eq!(
            p,
            Permission::Stream {
                stream_id: StreamId::from("diary"),
                level: PermissionLevel::CreateOnly,
            }
        );

        let p: Permission = serde_json::from_str(r#"{"tag": "work", "level": "read"}"#).unwrap();
        assert!(matches!(p, Permission::Tag { .. }));
        assert!(p.check_well_formed().is_ok());

        let p: Permission =
            serde_json::from_str(r#"{"feature": "selfRevoke", "setting": "forbidden"}"#).unwrap();
        assert!(p.check_well_formed().is_ok());

        let p: Permission =
            serde_json::from_str(r#"{"feature": "forcedStreams", "streams": ["diary"]}"#).unwrap();
        assert!(p.check_well_formed().is_ok());

        let p: Permission = serde_json::from_str(r#"{"feature": "selfAudit"}"#).unwrap();
        assert!(p.check_well_formed().is_err());
    }
}
