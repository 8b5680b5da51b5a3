//! Authority over other accesses: who may create or delete what.

use tessera_core::access::{
    Access, AccessType, FeatureKind, FeatureSetting, Permission, PermissionLevel,
};

use crate::AccessLogic;

/// Why an access creation or deletion request was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorityDenial {
    TypeNotAllowed,
    PermissionExceedsOwn { detail: String },
    SelfRevokeNotHeld,
}

impl std::fmt::Display for AuthorityDenial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthorityDenial::TypeNotAllowed => {
                f.write_str("this access type cannot create the requested access")
            }
            AuthorityDenial::PermissionExceedsOwn { detail } => {
                write!(f, "requested permission exceeds the creator's: {detail}")
            }
            AuthorityDenial::SelfRevokeNotHeld => {
                f.write_str("cannot forbid self-revocation without holding that setting")
            }
        }
    }
}

impl AccessLogic {
    /// May this access create an access of `requested_type` with
    /// `requested_permissions`?
    ///
    /// Personal creates anything. An app creates shared accesses only, and
    /// only with permissions strictly implied by its own (`create-only` is
    /// never delegable). Shared accesses create nothing.
    pub fn can_create_access(
        &self,
        requested_type: AccessType,
        requested_permissions: &[Permission],
    ) -> Result<(), AuthorityDenial> {
        match self.access.access_type {
            AccessType::Personal => Ok(()),
            AccessType::Shared => Err(AuthorityDenial::TypeNotAllowed),
            AccessType::App => {
                if requested_type != AccessType::Shared {
                    return Err(AuthorityDenial::TypeNotAllowed);
                }
                for permission in requested_permissions {
                    self.check_delegable(permission)?;
                }
                Ok(())
            }
        }
    }

    fn check_delegable(&self, permission: &Permission) -> Result<(), AuthorityDenial> {
        match permission {
            Permission::Stream { stream_id, level } => {
                let held = self.level_for(stream_id).unwrap_or(PermissionLevel::None);
                if !level.delegable_from(held) {
                    return Err(AuthorityDenial::PermissionExceedsOwn {
                        detail: format!("stream `{stream_id}`"),
                    });
                }
                Ok(())
            }
            Permission::Tag { tag, level } => {
                let held = if self.can_create_events_with_tag(tag) {
                    PermissionLevel::Contribute
                } else if self.can_get_events_with_tag(tag) {
                    PermissionLevel::Read
                } else {
                    PermissionLevel::None
                };
                if !level.delegable_from(held) {
                    return Err(AuthorityDenial::PermissionExceedsOwn {
                        detail: format!("tag `{tag}`"),
                    });
                }
                Ok(())
            }
            Permission::Feature {
                feature,
                setting,
                streams,
            } => match feature {
                FeatureKind::SelfRevoke | FeatureKind::SelfAudit => {
                    if *feature == FeatureKind::SelfRevoke
                        && *setting == Some(FeatureSetting::Forbidden)
                        && self.self_revoke_setting() != FeatureSetting::Forbidden
                    {
                        return Err(AuthorityDenial::SelfRevokeNotHeld);
                    }
                    Ok(())
                }
                FeatureKind::ForcedStreams => {
                    for stream in streams.iter().flatten() {
                        if !self.can_get_events_on_stream(stream) {
                            return Err(AuthorityDenial::PermissionExceedsOwn {
                                detail: format!("forced stream `{stream}`"),
                            });
                        }
                    }
                    Ok(())
                }
            },
        }
    }

    /// May this access delete `target`?
    ///
    /// Personal deletes anything. Any access may delete itself unless its
    /// self-revoke setting is forbidden. Apps additionally delete accesses
    /// they created.
    pub fn can_delete_access(&self, target: &Access) -> bool {
        match self.access.access_type {
            AccessType::Personal => true,
            AccessType::App | AccessType::Shared => {
                if target.id == self.access.id {
                    return self.self_revoke_setting() != FeatureSetting::Forbidden;
                }
                self.access.access_type == AccessType::App
                    && target.created_by == self.access.id.as_str()
            }
        }
    }
}
