//! Personal-token sessions.
//!
//! Only personal accesses have sessions. A session expires after the
//! configured inactivity window; every successful use of the personal token
//! touches `last_access`.

use bincode::{Decode, Encode};
use redb::ReadableTable as _;
use tessera_core::Timestamp;
use tessera_core::id::generate_token;
use tracing::debug;

use crate::{AccountsDb, AccountsResult, LOG_TARGET, decode, encode, session_tokens};

#[derive(Debug, Clone, Encode, Decode)]
pub struct SessionRecord {
    pub username: String,
    pub app_id: String,
    pub last_access: f64,
}

impl SessionRecord {
    pub fn is_expired(&self, now: Timestamp, max_age_secs: f64) -> bool {
        Timestamp::from_secs(self.last_access + max_age_secs).is_before(now)
    }
}

impl AccountsDb {
    /// Open a session and return its token.
    pub async fn create_session(&self, username: &str, app_id: &str) -> AccountsResult<String> {
        let token = generate_token();
        let record = SessionRecord {
            username: username.to_owned(),
            app_id: app_id.to_owned(),
            last_access: Timestamp::now().as_secs(),
        };
        self.write_with(|tx| {
            let mut table = tx.open_table(session_tokens::TABLE)?;
            table.insert(token.as_str(), encode(&record).as_slice())?;
            Ok(())
        })
        .await?;
        Ok(token)
    }

    /// Live session for a token; an expired one reads as absent (and is
    /// removed lazily by the sweep).
    pub async fn get_session(
        &self,
        token: &str,
        now: Timestamp,
        max_age_secs: f64,
    ) -> AccountsResult<Option<SessionRecord>> {
        self.read_with(|tx| {
            let table = tx.open_table(session_tokens::TABLE)?;
            let Some(guard) = table.get(token)? else {
                return Ok(None);
            };
            let record: SessionRecord = decode(session_tokens::NAME, guard.value())?;
            if record.is_expired(now, max_age_secs) {
                return Ok(None);
            }
            Ok(Some(record))
        })
        .await
    }

    /// Refresh `last_access`. Fire-and-forget on the hot path.
    pub async fn touch_session(&self, token: &str, now: Timestamp) -> AccountsResult<()> {
        self.write_with(|tx| {
            let mut table = tx.open_table(session_tokens::TABLE)?;
            let Some(guard) = table.get(token)? else {
                return Ok(());
            };
            let mut record: SessionRecord = decode(session_tokens::NAME, guard.value())?;
            drop(guard);
            record.last_access = now.as_secs();
            table.insert(token, encode(&record).as_slice())?;
            Ok(())
        })
        .await
    }

    pub async fn delete_session(&self, token: &str) -> AccountsResult<bool> {
        self.write_with(|tx| {
            let mut table = tx.open_table(session_tokens::TABLE)?;
            Ok(table.remove(token)?.is_some())
        })
        .await
    }

    pub async fn delete_sessions_for(&self, username: &str) -> AccountsResult<usize> {
        self.write_with(|tx| {
            let mut table = tx.open_table(session_tokens::TABLE)?;
            let tokens: Vec<String> = table
                .range::<&str>(..)?
                .filter_map(|entry| {
                    entry
                        .map(|(k, v)| {
                            decode::<SessionRecord>(session_tokens::NAME, v.value())
                                .ok()
                                .filter(|record| record.username == username)
                                .map(|_| k.value().to_owned())
                        })
                        .transpose()
                })
                .collect::<Result<_, _>>()?;
            for token in &tokens {
                table.remove(token.as_str())?;
            }
            Ok(tokens.len())
        })
        .await
    }

    /// Drop every expired session; returns how many were removed.
    pub async fn sweep_expired_sessions(
        &self,
        now: Timestamp,
        max_age_secs: f64,
    ) -> AccountsResult<usize> {
        let removed = self
            .write_with(|tx| {
                let mut table = tx.open_table(session_tokens::TABLE)?;
                let expired: Vec<String> = table
                    .range::<&str>(..)?
                    .filter_map(|entry| {
                        entry
                            .map(|(k, v)| {
                                decode::<SessionRecord>(session_tokens::NAME, v.value())
                                    .ok()
                                    .filter(|record| record.is_expired(now, max_age_secs))
                                    .map(|_| k.value().to_owned())
                            })
                            .transpose()
                    })
                    .collect::<Result<_, _>>()?;
                for token in &expired {
                    table.remove(token.as_str())?;
                }
                Ok(expired.len())
            })
            .await?;
        if removed > 0 {
            debug!(target: LOG_TARGET, removed, "Swept expired sessions");
        }
        Ok(removed)
    }
}
