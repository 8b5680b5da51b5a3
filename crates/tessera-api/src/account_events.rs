//! Rules for events on account streams.
//!
//! Account attributes are events, but with extra invariants: one account
//! stream per event, editability per the catalogue, a single `.active`
//! holder per stream, and the service-register kept in step for indexed
//! fields. A register rejection rolls the local mutation back, so the two
//! sides never diverge silently.

use std::collections::BTreeMap;

use tessera_catalog::SystemStream;
use tessera_core::event::Event;
use tessera_core::id::UserId;
use tessera_core::stream::{ACTIVE_MARKER, StreamId, UNIQUE_MARKER};
use tessera_core::{ApiError, Timestamp};
use tessera_registry::{FieldEntry, RegisterError, UserUpdate, sanitize_conflicts};
use tessera_user_db::MarkerWriteReceipt;
use tracing::warn;

use crate::{AppState, LOG_TARGET, RequestResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountWrite {
    Create,
    Update,
}

impl AppState {
    /// The account leaf an event's stream list points at, if any.
    ///
    /// Account events carry exactly one account leaf plus markers; a second
    /// leaf, an unrelated stream riding along, or a stray marker/branch all
    /// reject as domain violations.
    pub fn account_leaf_for<'s>(
        &'s self,
        stream_ids: &[StreamId],
    ) -> Result<Option<&'s SystemStream>, ApiError> {
        self.catalog
            .classify_account_streams(stream_ids)
            .map_err(|err| ApiError::invalid_operation(err.to_string()))
    }

    /// Create or overwrite an account event, maintaining the `.active`
    /// invariant locally and the indexed fields on the register. On a
    /// register rejection the local write is undone and the rejection is
    /// surfaced.
    pub async fn write_account_event(
        &self,
        user_id: &UserId,
        username: &str,
        event: &mut Event,
        stream: &SystemStream,
        write: AccountWrite,
    ) -> RequestResult<()> {
        if !self.catalog.is_editable(&stream.id) {
            return Err(ApiError::invalid_operation(format!(
                "Account stream `{}` is not editable",
                stream.id,
            ))
            .into());
        }

        let bare = stream.unprefixed_id();
        let unique = self.catalog.is_unique(bare);
        ensure_markers(event, unique);

        let db = self.user_dbs.get_or_open(user_id).await?;
        let receipt = db
            .write_event_with_marker_takeover(
                event,
                &StreamId::new(stream.id.clone()),
                &StreamId::from(ACTIVE_MARKER),
                write == AccountWrite::Update,
            )
            .await?;

        if !self.catalog.is_indexed(bare) {
            return Ok(());
        }

        let value = event.content.clone().unwrap_or(serde_json::Value::Null);
        let mut user = BTreeMap::new();
        user.insert(
            bare.to_owned(),
            vec![FieldEntry {
                value: value.clone(),
                is_unique: unique,
                is_active: true,
                creation: false,
            }],
        );
        let update = UserUpdate {
            username: username.to_owned(),
            user,
            fields_to_delete: BTreeMap::new(),
        };

        if let Err(err) = self.register.update_user(&update).await {
            self.rollback_account_write(user_id, event, &receipt, write)
                .await;
            let submitted: BTreeMap<String, serde_json::Value> =
                [(bare.to_owned(), value)].into();
            return Err(register_error_to_api(err, &submitted, username).into());
        }
        Ok(())
    }

    /// Tombstone a non-active account event and withdraw the value from
    /// the register when indexed. The currently active event may not be
    /// deleted.
    pub async fn delete_account_event(
        &self,
        user_id: &UserId,
        username: &str,
        event: &Event,
        stream: &SystemStream,
        now: Timestamp,
    ) -> RequestResult<()> {
        if !self.catalog.is_editable(&stream.id) {
            return Err(ApiError::invalid_operation(format!(
                "Account stream `{}` is not editable",
                stream.id,
            ))
            .into());
        }
        if event
            .stream_ids
            .iter()
            .any(|s| s.as_str() == ACTIVE_MARKER)
        {
            return Err(ApiError::invalid_operation(
                "The active account value cannot be deleted; supersede it instead",
            )
            .into());
        }

        let db = self.user_dbs.get_or_open(user_id).await?;
        db.tombstone_event(&event.id, now).await?;
        db.minimize_history(&event.id).await?;

        let bare = stream.unprefixed_id();
        if self.catalog.is_indexed(bare) {
            let value = event.content.clone().unwrap_or(serde_json::Value::Null);
            let update = UserUpdate {
                username: username.to_owned(),
                user: BTreeMap::new(),
                fields_to_delete: [(bare.to_owned(), value)].into(),
            };
            if let Err(err) = self.register.update_user(&update).await {
                // deletion of a non-active value cannot collide; failures
                // here are availability problems and must not resurrect
                // the event silently
                warn!(target: LOG_TARGET, %err, "Register not updated after account event deletion");
            }
        }
        Ok(())
    }

    async fn rollback_account_write(
        &self,
        user_id: &UserId,
        event: &Event,
        receipt: &MarkerWriteReceipt,
        write: AccountWrite,
    ) {
        let db = match self.user_dbs.get_or_open(user_id).await {
            Ok(db) => db,
            Err(err) => {
                warn!(target: LOG_TARGET, %err, "Rollback could not open user database");
                return;
            }
        };

        match write {
            AccountWrite::Create => {
                if let Err(err) = db.purge_event(&event.id).await {
                    warn!(target: LOG_TARGET, %err, "Rollback purge failed");
                }
            }
            AccountWrite::Update => {
                if let Some(frozen) = &receipt.frozen {
                    let mut restored = frozen.clone();
                    restored.id = event.id.clone();
                    restored.head_id = None;
                    if let Err(err) = db.update_event(&restored).await {
                        warn!(target: LOG_TARGET, %err, "Rollback restore failed");
                    }
                    if let Err(err) = db.purge_event(&frozen.id).await {
                        warn!(target: LOG_TARGET, %err, "Rollback history cleanup failed");
                    }
                }
            }
        }

        for demoted in &receipt.demoted {
            let Ok(Some(mut holder)) = db.get_event(demoted).await else {
                continue;
            };
            holder.stream_ids.push(StreamId::from(ACTIVE_MARKER));
            if let Err(err) = db.rewrite_stream_ids(demoted, &holder.stream_ids).await {
                warn!(target: LOG_TARGET, %err, "Rollback marker restore failed");
            }
        }
    }
}

/// Account events always carry the `.active` marker for their stream, and
/// `.unique` on unique streams.
fn ensure_markers(event: &mut Event, unique: bool) {
    if !event
        .stream_ids
        .iter()
        .any(|s| s.as_str() == ACTIVE_MARKER)
    {
        event.stream_ids.push(StreamId::from(ACTIVE_MARKER));
    }
    if unique
        && !event
            .stream_ids
            .iter()
            .any(|s| s.as_str() == UNIQUE_MARKER)
    {
        event.stream_ids.push(StreamId::from(UNIQUE_MARKER));
    }
}

/// Translate a register failure, sanitizing collision payloads against what
/// this request actually submitted.
pub fn register_error_to_api(
    err: RegisterError,
    submitted: &BTreeMap<String, serde_json::Value>,
    username: &str,
) -> ApiError {
    match err {
        RegisterError::ItemAlreadyExists { data } => ApiError::ItemAlreadyExists {
            data: serde_json::Value::Object(sanitize_conflicts(&data, submitted, username)),
        },
        RegisterError::InvalidInvitationToken => ApiError::InvalidInvitationToken,
        RegisterError::Rejected { status, message } => {
            ApiError::invalid_parameters(format!("register rejected the request ({status}): {message}"))
        }
        RegisterError::Unavailable { message } => {
            ApiError::unexpected(Box::<dyn std::error::Error + Send + Sync>::from(message))
        }
    }
}
