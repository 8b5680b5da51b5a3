//! Per-user SQLite event stores.
//!
//! One database file per user, holding that user's events, their frozen
//! history rows and deletion tombstones. `streamIds` is stored as a
//! space-separated token string terminated by the universal tag `..` and
//! mirrored into an FTS5 table, which is what makes stream queries (boolean
//! combinations over stream ids) a single `MATCH` expression.
//!
//! # Concurrency
//!
//! Databases are opened in WAL mode. Each store keeps one write connection
//! and one shared read connection; streaming reads open a throwaway
//! read-only connection so a long export never blocks queries or writes.
//! Writes run inside one transaction each and retry on `SQLITE_BUSY` with
//! exponential backoff; exhausting the retry budget is an error surfaced to
//! the caller.

mod codec;
mod ops;
mod pool;
pub mod query;
mod schema;

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use backon::{BlockingRetryable as _, ExponentialBuilder};
use rusqlite::{Connection, OpenFlags};
use snafu::{Location, ResultExt as _, Snafu};
use tessera_core::id::UserId;
use tracing::debug;

pub use self::ops::MarkerWriteReceipt;
pub use self::pool::UserDbPool;
pub use self::query::{AndBlock, EventsQuery, QueryClause, StreamQuery, StreamQueryItem};

const LOG_TARGET: &str = "tessera::user_db";

/// Universal tag terminating every stored `streamIds` string; a tombstone's
/// stream list degenerates to just this tag.
pub const UNIVERSAL_TAG: &str = "..";

#[derive(Debug, Snafu)]
pub enum DbError {
    #[snafu(display("Failed to open user database at {}", path.display()))]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
        #[snafu(implicit)]
        location: Location,
    },

    Sql {
        source: rusqlite::Error,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Write retry budget exhausted"))]
    Contended {
        source: rusqlite::Error,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Event `{event_id}` not found"))]
    EventNotFound { event_id: String },

    #[snafu(display("Malformed stored row: {message}"))]
    Row {
        message: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Unsupported query: {message}"))]
    Query { message: String },

    Io {
        source: std::io::Error,
        #[snafu(implicit)]
        location: Location,
    },
}

pub type DbResult<T> = std::result::Result<T, DbError>;

/// Handle to one user's event database.
#[derive(Debug)]
pub struct UserEventDb {
    path: PathBuf,
    write_conn: Mutex<Connection>,
    read_conn: Mutex<Connection>,
}

impl UserEventDb {
    /// File name of a user's database under the data directory.
    pub fn db_path(base_dir: &Path, user_id: &UserId) -> PathBuf {
        base_dir.join(format!("{user_id}.sqlite"))
    }

    pub async fn open(path: impl Into<PathBuf>) -> DbResult<UserEventDb> {
        let path = path.into();
        debug!(target: LOG_TARGET, path = %path.display(), "Opening user database");

        tokio::task::block_in_place(|| {
            let write_conn = Connection::open(&path).context(OpenSnafu { path: &path })?;
            Self::init_wal(&write_conn).context(SqlSnafu)?;
            schema::init(&write_conn).context(SqlSnafu)?;

            let read_conn = Connection::open_with_flags(
                &path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .context(OpenSnafu { path: &path })?;

            Ok(UserEventDb {
                path,
                write_conn: Mutex::new(write_conn),
                read_conn: Mutex::new(read_conn),
            })
        })
    }

    fn init_wal(conn: &Connection) -> rusqlite::Result<()> {
        conn.query_row("PRAGMA journal_mode=WAL", [], |row| {
            row.get::<_, String>(0)
        })?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(Duration::from_millis(50))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a read closure on the shared read connection.
    pub async fn read_with<T>(
        &self,
        f: impl FnOnce(&Connection) -> DbResult<T>,
    ) -> DbResult<T> {
        tokio::task::block_in_place(|| {
            let conn = self.read_conn.lock().expect("Locking failed");
            f(&conn)
        })
    }

    /// Run a write closure inside one transaction, retrying the whole
    /// transaction on `SQLITE_BUSY` until the fixed budget runs out.
    pub async fn write_with<T>(
        &self,
        mut f: impl FnMut(&Connection) -> DbResult<T>,
    ) -> DbResult<T> {
        tokio::task::block_in_place(|| {
            let conn = self.write_conn.lock().expect("Locking failed");

            let attempt = || -> DbResult<T> {
                let tx = conn.unchecked_transaction().context(SqlSnafu)?;
                let res = f(&tx)?;
                tx.commit().context(SqlSnafu)?;
                Ok(res)
            };
            attempt
                .retry(
                    ExponentialBuilder::default()
                        .with_min_delay(Duration::from_millis(5))
                        .with_max_times(8),
                )
                .when(|err| is_busy(err))
                .call()
                .map_err(|err| match err {
                    // budget exhausted while still busy
                    DbError::Sql { source, location } if is_busy_sqlite(&source) => {
                        DbError::Contended { source, location }
                    }
                    other => other,
                })
        })
    }

    /// Throwaway read-only connection for streaming reads.
    pub(crate) fn open_streaming_conn(&self) -> DbResult<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .context(OpenSnafu { path: &self.path })?;
        Ok(conn)
    }
}

fn is_busy(err: &DbError) -> bool {
    match err {
        DbError::Sql { source, .. } => is_busy_sqlite(source),
        _ => false,
    }
}

fn is_busy_sqlite(source: &rusqlite::Error) -> bool {
    matches!(
        source.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
    )
}

#[cfg(test)]
mod tests;
