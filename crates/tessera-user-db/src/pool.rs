//! Bounded pool of open per-user databases.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;

use lru::LruCache;
use snafu::ResultExt as _;
use tessera_core::id::UserId;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{DbResult, IoSnafu, LOG_TARGET, UserEventDb};

/// LRU of open databases, keyed by user. Evicting an entry drops the last
/// pool reference; the connections close when in-flight calls finish.
pub struct UserDbPool {
    base_dir: PathBuf,
    inner: Mutex<LruCache<UserId, Arc<UserEventDb>>>,
}

impl UserDbPool {
    pub async fn new(base_dir: impl Into<PathBuf>, capacity: usize) -> DbResult<UserDbPool> {
        let base_dir = base_dir.into();
        tokio::fs::create_dir_all(&base_dir).await.context(IoSnafu)?;
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("non-zero");
        Ok(UserDbPool {
            base_dir,
            inner: Mutex::new(LruCache::new(capacity)),
        })
    }

    pub async fn get_or_open(&self, user_id: &UserId) -> DbResult<Arc<UserEventDb>> {
        let mut pool = self.inner.lock().await;
        if let Some(db) = pool.get(user_id) {
            return Ok(db.clone());
        }

        let path = UserEventDb::db_path(&self.base_dir, user_id);
        let db = Arc::new(UserEventDb::open(path).await?);
        if let Some((evicted, _)) = pool.push(user_id.clone(), db.clone()) {
            if evicted != *user_id {
                debug!(target: LOG_TARGET, user = %evicted, "Evicted user database from pool");
            }
        }
        Ok(db)
    }

    /// Drop the pooled handle, e.g. before deleting the user.
    pub async fn evict(&self, user_id: &UserId) {
        self.inner.lock().await.pop(user_id);
    }

    /// Evict and remove the database files from disk.
    pub async fn delete_user_db(&self, user_id: &UserId) -> DbResult<()> {
        self.evict(user_id).await;
        let path = UserEventDb::db_path(&self.base_dir, user_id);
        for suffix in ["", "-wal", "-shm"] {
            let mut file = path.clone().into_os_string();
            file.push(suffix);
            match tokio::fs::remove_file(PathBuf::from(file)).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err).context(IoSnafu),
            }
        }
        Ok(())
    }
}
