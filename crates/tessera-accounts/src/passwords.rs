//! Password hashes with bounded rotation history.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher as _, PasswordVerifier as _};
use bincode::{Decode, Encode};
use redb::ReadableTable as _;
use tessera_core::Timestamp;
use tessera_core::id::UserId;

use crate::{AccountsDb, AccountsError, AccountsResult, decode, encode, password_histories};

/// One hash with who set it and when. The hash is a PHC string and opaque
/// to everything but [`verify_against`].
#[derive(Debug, Clone, Encode, Decode)]
pub struct PasswordEntry {
    pub hash: String,
    pub access_id: String,
    pub modified_at: f64,
}

/// Newest first.
#[derive(Debug, Clone, Default, Encode, Decode)]
pub struct PasswordHistoryRecord {
    pub entries: Vec<PasswordEntry>,
}

pub fn hash_password(password: &str) -> AccountsResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| AccountsError::PasswordHash {
            message: err.to_string(),
        })
}

fn verify_against(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

impl AccountsDb {
    /// Prepend a new hash and truncate the history to `history_depth`.
    pub async fn set_password_hash(
        &self,
        user_id: &UserId,
        hash: String,
        access_id: &str,
        history_depth: usize,
    ) -> AccountsResult<()> {
        let entry = PasswordEntry {
            hash,
            access_id: access_id.to_owned(),
            modified_at: Timestamp::now().as_secs(),
        };
        self.write_with(|tx| {
            let mut table = tx.open_table(password_histories::TABLE)?;
            let mut record = match table.get(user_id.as_str())? {
                Some(guard) => decode::<PasswordHistoryRecord>(password_histories::NAME, guard.value())?,
                None => PasswordHistoryRecord::default(),
            };
            record.entries.insert(0, entry);
            record.entries.truncate(history_depth.max(1));
            table.insert(user_id.as_str(), encode(&record).as_slice())?;
            Ok(())
        })
        .await
    }

    async fn password_history(&self, user_id: &UserId) -> AccountsResult<PasswordHistoryRecord> {
        self.read_with(|tx| {
            let table = tx.open_table(password_histories::TABLE)?;
            match table.get(user_id.as_str())? {
                Some(guard) => decode(password_histories::NAME, guard.value()),
                None => Ok(PasswordHistoryRecord::default()),
            }
        })
        .await
    }

    /// Check a password against the current hash.
    pub async fn verify_password(&self, user_id: &UserId, password: &str) -> AccountsResult<bool> {
        let record = self.password_history(user_id).await?;
        Ok(record
            .entries
            .first()
            .is_some_and(|entry| verify_against(password, &entry.hash)))
    }

    /// "No reuse of last N": does the candidate match any of the `n` most
    /// recent hashes (current one included)?
    pub async fn password_used_recently(
        &self,
        user_id: &UserId,
        password: &str,
        n: usize,
    ) -> AccountsResult<bool> {
        let record = self.password_history(user_id).await?;
        Ok(record
            .entries
            .iter()
            .take(n)
            .any(|entry| verify_against(password, &entry.hash)))
    }

    pub async fn delete_password_history(&self, user_id: &UserId) -> AccountsResult<()> {
        self.write_with(|tx| {
            let mut table = tx.open_table(password_histories::TABLE)?;
            table.remove(user_id.as_str())?;
            Ok(())
        })
        .await
    }
}
