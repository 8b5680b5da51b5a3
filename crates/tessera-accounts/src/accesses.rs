//! Persisted access records.
//!
//! Accesses belong to one user; keys are `<user id>\n<access id>`, with a
//! token index alongside for the hot lookup on every request. Records are
//! stored as their JSON wire form: unlike the other tables they carry
//! nested permission structures that already have a canonical serde shape.

use redb::ReadableTable as _;
use tessera_core::Timestamp;
use tessera_core::access::Access;
use tessera_core::id::{AccessId, UserId};

use crate::{AccountsDb, AccountsResult, RecordSnafu, access_records, access_tokens};

fn record_key(user_id: &UserId, access_id: &AccessId) -> String {
    format!("{user_id}\n{access_id}")
}

fn token_key(user_id: &UserId, token: &str) -> String {
    format!("{user_id}\n{token}")
}

fn decode_access(bytes: &[u8]) -> AccountsResult<Access> {
    serde_json::from_slice(bytes).map_err(|_| {
        RecordSnafu {
            table: access_records::NAME,
        }
        .build()
    })
}

impl AccountsDb {
    /// Insert or overwrite an access record, keeping the token index in
    /// step.
    pub async fn store_access(&self, user_id: &UserId, access: &Access) -> AccountsResult<()> {
        let encoded = serde_json::to_vec(access).expect("access serializes");
        self.write_with(|tx| {
            let mut records = tx.open_table(access_records::TABLE)?;
            let mut tokens = tx.open_table(access_tokens::TABLE)?;

            let key = record_key(user_id, &access.id);
            // token may have changed or been cleared on deletion
            if let Some(previous) = records.insert(key.as_str(), encoded.as_slice())? {
                let old: Access = decode_access(previous.value())?;
                drop(previous);
                if let Some(old_token) = &old.token {
                    if access.token.as_deref() != Some(old_token.as_str()) {
                        tokens.remove(token_key(user_id, old_token).as_str())?;
                    }
                }
            }
            if let Some(token) = &access.token {
                tokens.insert(
                    token_key(user_id, token).as_str(),
                    access.id.as_str().as_bytes(),
                )?;
            }
            Ok(())
        })
        .await
    }

    pub async fn get_access_by_id(
        &self,
        user_id: &UserId,
        access_id: &AccessId,
    ) -> AccountsResult<Option<Access>> {
        let key = record_key(user_id, access_id);
        self.read_with(|tx| {
            let records = tx.open_table(access_records::TABLE)?;
            match records.get(key.as_str())? {
                Some(guard) => decode_access(guard.value()).map(Some),
                None => Ok(None),
            }
        })
        .await
    }

    pub async fn get_access_by_token(
        &self,
        user_id: &UserId,
        token: &str,
    ) -> AccountsResult<Option<Access>> {
        let key = token_key(user_id, token);
        self.read_with(|tx| {
            let tokens = tx.open_table(access_tokens::TABLE)?;
            let Some(guard) = tokens.get(key.as_str())? else {
                return Ok(None);
            };
            let access_id = String::from_utf8_lossy(guard.value()).into_owned();
            drop(guard);

            let records = tx.open_table(access_records::TABLE)?;
            let record_key = format!("{user_id}\n{access_id}");
            match records.get(record_key.as_str())? {
                Some(guard) => decode_access(guard.value()).map(Some),
                None => Ok(None),
            }
        })
        .await
    }

    /// All of a user's accesses; deleted ones only when `include_deleted`.
    pub async fn list_accesses(
        &self,
        user_id: &UserId,
        include_deleted: bool,
    ) -> AccountsResult<Vec<Access>> {
        let prefix = format!("{user_id}\n");
        self.read_with(|tx| {
            let records = tx.open_table(access_records::TABLE)?;
            let mut out = Vec::new();
            let upper = format!("{prefix}\u{10FFFF}");
            for entry in records.range(prefix.as_str()..upper.as_str())? {
                let (_key, value) = entry?;
                let access = decode_access(value.value())?;
                if include_deleted || access.deleted.is_none() {
                    out.push(access);
                }
            }
            Ok(out)
        })
        .await
    }

    /// Is `(name, type, deviceName)` already taken among live accesses?
    pub async fn access_identity_taken(
        &self,
        user_id: &UserId,
        candidate: &Access,
    ) -> AccountsResult<bool> {
        let live = self.list_accesses(user_id, false).await?;
        Ok(live
            .iter()
            .any(|a| a.id != candidate.id && a.identity_key() == candidate.identity_key()))
    }

    /// Soft-delete: clear the token, stamp `deleted`.
    pub async fn mark_access_deleted(
        &self,
        user_id: &UserId,
        access_id: &AccessId,
        when: Timestamp,
    ) -> AccountsResult<Option<Access>> {
        let Some(mut access) = self.get_access_by_id(user_id, access_id).await? else {
            return Ok(None);
        };
        if access.deleted.is_some() {
            return Ok(Some(access));
        }
        access.deleted = Some(when);
        access.token = None;
        self.store_access(user_id, &access).await?;
        Ok(Some(access))
    }

    /// Remove every access record of a user (user deletion).
    pub async fn delete_accesses_for(&self, user_id: &UserId) -> AccountsResult<usize> {
        let prefix = format!("{user_id}\n");
        self.write_with(|tx| {
            let mut records = tx.open_table(access_records::TABLE)?;
            let mut tokens = tx.open_table(access_tokens::TABLE)?;
            let upper = format!("{prefix}\u{10FFFF}");

            let keys: Vec<String> = records
                .range(prefix.as_str()..upper.as_str())?
                .map(|entry| entry.map(|(k, _)| k.value().to_owned()))
                .collect::<Result<_, _>>()?;
            for key in &keys {
                records.remove(key.as_str())?;
            }

            let token_keys: Vec<String> = tokens
                .range(prefix.as_str()..upper.as_str())?
                .map(|entry| entry.map(|(k, _)| k.value().to_owned()))
                .collect::<Result<_, _>>()?;
            for key in &token_keys {
                tokens.remove(key.as_str())?;
            }
            Ok(keys.len())
        })
        .await
    }
}
