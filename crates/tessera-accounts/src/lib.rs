//! Node-global account storage.
//!
//! One small key-value database holds everything that is not a user's event
//! stream: the username↔userId index, password hashes with their rotation
//! history, personal-token sessions, and the locally-enforced uniqueness
//! index used in standalone deployments. Per-user event data lives
//! elsewhere, one SQLite file per user.

mod accesses;
mod passwords;
mod sessions;
mod tables;
mod users;

use std::path::PathBuf;
use std::sync::Mutex;

use bincode::{Decode, Encode};
use lru::LruCache;
use snafu::{Location, ResultExt as _, Snafu};
use tessera_core::id::UserId;
use tracing::debug;

pub use self::passwords::{PasswordEntry, hash_password};
pub use self::sessions::SessionRecord;
pub(crate) use self::tables::*;

const LOG_TARGET: &str = "tessera::accounts";

/// Usernames cached per process; invalidated on any index write.
const USERNAME_CACHE_SIZE: usize = 10_000;

#[derive(Debug, Snafu)]
pub enum AccountsError {
    Database {
        source: redb::DatabaseError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Table {
        source: redb::TableError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Storage {
        source: redb::StorageError,
        #[snafu(implicit)]
        location: Location,
    },
    Transaction {
        #[snafu(source(from(redb::TransactionError, Box::new)))]
        source: Box<redb::TransactionError>,
        #[snafu(implicit)]
        location: Location,
    },
    Commit {
        source: redb::CommitError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Corrupt record in `{table}`"))]
    Record {
        table: &'static str,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Username `{username}` is already taken"))]
    UsernameTaken { username: String },
    #[snafu(display("User id `{user_id}` is already indexed"))]
    UserIdTaken { user_id: UserId },
    #[snafu(display("Password hashing failed: {message}"))]
    PasswordHash { message: String },
}

pub type AccountsResult<T> = std::result::Result<T, AccountsError>;

pub struct AccountsDb {
    inner: redb::Database,
    username_cache: Mutex<LruCache<String, UserId>>,
}

impl AccountsDb {
    pub async fn open(path: impl Into<PathBuf>) -> AccountsResult<AccountsDb> {
        let path = path.into();
        debug!(target: LOG_TARGET, path = %path.display(), "Opening accounts database");
        let inner = tokio::task::block_in_place(|| redb::Database::create(&path))
            .context(DatabaseSnafu)?;
        Self::open_inner(inner).await
    }

    pub async fn open_in_memory() -> AccountsResult<AccountsDb> {
        let inner = redb::Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .context(DatabaseSnafu)?;
        Self::open_inner(inner).await
    }

    async fn open_inner(inner: redb::Database) -> AccountsResult<AccountsDb> {
        let db = AccountsDb {
            inner,
            username_cache: Mutex::new(LruCache::new(
                std::num::NonZeroUsize::new(USERNAME_CACHE_SIZE).expect("non-zero"),
            )),
        };
        // make sure every table exists before the first read transaction
        db.write_with(|tx| {
            tx.open_table(users_by_name::TABLE)?;
            tx.open_table(users_by_id::TABLE)?;
            tx.open_table(password_histories::TABLE)?;
            tx.open_table(session_tokens::TABLE)?;
            tx.open_table(platform_unique::TABLE)?;
            tx.open_table(access_records::TABLE)?;
            tx.open_table(access_tokens::TABLE)?;
            Ok(())
        })
        .await?;
        Ok(db)
    }

    pub async fn write_with<T>(
        &self,
        f: impl FnOnce(&redb::WriteTransaction) -> AccountsResult<T>,
    ) -> AccountsResult<T> {
        tokio::task::block_in_place(|| {
            let tx = self.inner.begin_write().context(TransactionSnafu)?;
            let res = f(&tx)?;
            tx.commit().context(CommitSnafu)?;
            Ok(res)
        })
    }

    pub async fn read_with<T>(
        &self,
        f: impl FnOnce(&redb::ReadTransaction) -> AccountsResult<T>,
    ) -> AccountsResult<T> {
        tokio::task::block_in_place(|| {
            let tx = self.inner.begin_read().context(TransactionSnafu)?;
            f(&tx)
        })
    }

    pub(crate) fn cache_insert(&self, username: &str, user_id: &UserId) {
        self.username_cache
            .lock()
            .expect("Locking failed")
            .put(username.to_owned(), user_id.clone());
    }

    pub(crate) fn cache_get(&self, username: &str) -> Option<UserId> {
        self.username_cache
            .lock()
            .expect("Locking failed")
            .get(username)
            .cloned()
    }

    pub(crate) fn cache_invalidate(&self, username: &str) {
        self.username_cache
            .lock()
            .expect("Locking failed")
            .pop(username);
    }

    pub(crate) fn cache_clear(&self) {
        self.username_cache.lock().expect("Locking failed").clear();
    }
}

/// Encode a record for storage.
pub(crate) fn encode<T: Encode>(value: &T) -> Vec<u8> {
    bincode::encode_to_vec(value, bincode::config::standard()).expect("bincode encoding")
}

/// Decode a stored record, surfacing corruption as [`AccountsError::Record`].
pub(crate) fn decode<T: Decode<()>>(table: &'static str, bytes: &[u8]) -> AccountsResult<T> {
    let (value, _len) = bincode::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|_| RecordSnafu { table }.build())?;
    Ok(value)
}

#[cfg(test)]
mod tests;
