//! The users repository.
//!
//! A user has no row of their own: the account is the set of events on the
//! reserved account streams, recomposed by walking the streams catalogue.

use std::collections::BTreeMap;

use tessera_catalog::SystemStream;
use tessera_core::Timestamp;
use tessera_core::event::Event;
use tessera_core::id::{EventId, UserId};
use tessera_core::stream::{ACTIVE_MARKER, StreamId, UNIQUE_MARKER};
use tracing::{info, warn};

use crate::{AppState, LOG_TARGET, RequestResult};

/// Build the account event for one attribute value.
pub fn account_event(
    stream: &SystemStream,
    value: serde_json::Value,
    unique: bool,
    author: &str,
    now: Timestamp,
) -> Event {
    let mut stream_ids = vec![StreamId::new(stream.id.clone()), StreamId::from(ACTIVE_MARKER)];
    if unique {
        stream_ids.push(StreamId::from(UNIQUE_MARKER));
    }
    Event {
        id: EventId::generate(),
        stream_ids,
        event_type: stream.event_type.clone(),
        content: Some(value),
        time: now,
        end_time: None,
        created: now,
        created_by: author.to_owned(),
        modified: now,
        modified_by: author.to_owned(),
        trashed: false,
        deleted: None,
        head_id: None,
        integrity: None,
        attachments: vec![],
        description: None,
        client_data: None,
    }
}

impl AppState {
    /// Latest active value of one account attribute (bare name).
    pub async fn account_value(
        &self,
        user_id: &UserId,
        unprefixed: &str,
    ) -> RequestResult<Option<serde_json::Value>> {
        let Some(stream) = self.catalog.get_by_unprefixed(unprefixed) else {
            return Ok(None);
        };
        let db = self.user_dbs.get_or_open(user_id).await?;
        let events = db.get_events_on_stream(&stream.id).await?;
        let active = events
            .iter()
            .find(|e| e.stream_ids.iter().any(|s| s.as_str() == ACTIVE_MARKER))
            .or_else(|| events.first());
        Ok(active.and_then(|e| e.content.clone()))
    }

    /// Recompose the visible account attributes from the event store.
    pub async fn account_attributes(
        &self,
        user_id: &UserId,
    ) -> RequestResult<BTreeMap<String, serde_json::Value>> {
        let db = self.user_dbs.get_or_open(user_id).await?;
        let mut out = BTreeMap::new();
        for stream in self.catalog.account_attribute_leaves() {
            if !stream.is_shown {
                continue;
            }
            let events = db.get_events_on_stream(&stream.id).await?;
            let active = events
                .iter()
                .find(|e| e.stream_ids.iter().any(|s| s.as_str() == ACTIVE_MARKER))
                .or_else(|| events.first());
            if let Some(value) = active.and_then(|e| e.content.clone()) {
                out.insert(stream.unprefixed_id().to_owned(), value);
            }
        }
        Ok(out)
    }

    /// Insert one event per provided (or defaulted) account attribute.
    /// Returns the created events.
    pub async fn create_account_events(
        &self,
        user_id: &UserId,
        values: &BTreeMap<String, serde_json::Value>,
        author: &str,
        now: Timestamp,
    ) -> RequestResult<Vec<Event>> {
        let db = self.user_dbs.get_or_open(user_id).await?;
        let mut created = Vec::new();
        for stream in self.catalog.account_attribute_leaves() {
            let value = values
                .get(stream.unprefixed_id())
                .cloned()
                .or_else(|| stream.default.clone());
            let Some(value) = value else { continue };

            let unique = self.catalog.is_unique(stream.unprefixed_id());
            let event = account_event(stream, value, unique, author, now);
            db.create_event(&event).await?;
            created.push(event);
        }
        Ok(created)
    }

    /// Remove every local trace of a user: event store, passwords,
    /// sessions, accesses, index row, caches. Register-side cleanup is the
    /// caller's step.
    pub async fn delete_user_local(&self, user_id: &UserId, username: &str) -> RequestResult<()> {
        self.user_dbs.delete_user_db(user_id).await?;
        self.accounts.delete_password_history(user_id).await?;
        self.accounts.delete_sessions_for(username).await?;
        self.accounts.delete_accesses_for(user_id).await?;
        self.accounts.release_unique_for(user_id).await?;
        if self.accounts.delete_user_by_id(user_id).await?.is_none() {
            warn!(target: LOG_TARGET, %username, "User index row was already gone");
        }
        self.access_cache_evict_user(user_id);
        info!(target: LOG_TARGET, %username, "Deleted user locally");
        Ok(())
    }
}
