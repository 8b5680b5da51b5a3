//! Disk cache of derived image previews.
//!
//! Previews are derived from `picture/attached` events and keyed by
//! `(eventId, dimension)`, with the requested dimension rounded up into a
//! fixed ladder. Each cached file carries two extended attributes: the
//! originating event's `modified` timestamp (freshness key) and the last
//! access time (sweep key). A background sweep removes files unused for
//! longer than the configured age; a lock keeps sweeps mutually exclusive.

use std::io;
use std::path::{Path, PathBuf};

use snafu::{Location, ResultExt as _, Snafu};
use tessera_core::Timestamp;
use tessera_core::id::EventId;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const LOG_TARGET: &str = "tessera::previews";

/// Cached preview dimensions; requests round up to the smallest fit.
pub const DIMENSIONS: [u32; 4] = [256, 512, 768, 1024];

const XATTR_EVENT_MODIFIED: &str = "user.tessera.eventModified";
const XATTR_LAST_ACCESSED: &str = "user.tessera.lastAccessed";

#[derive(Debug, Snafu)]
pub enum PreviewError {
    Io {
        source: io::Error,
        #[snafu(implicit)]
        location: Location,
    },
}

pub type PreviewResult<T> = std::result::Result<T, PreviewError>;

/// Round a requested dimension up into the ladder (largest rung caps it).
pub fn round_up_dimension(requested: u32) -> u32 {
    DIMENSIONS
        .iter()
        .copied()
        .find(|&d| requested <= d)
        .unwrap_or(DIMENSIONS[DIMENSIONS.len() - 1])
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SweepStats {
    pub scanned: usize,
    pub removed: usize,
    pub skipped_on_error: usize,
}

pub struct PreviewCache {
    root: PathBuf,
    max_age_secs: f64,
    sweep_lock: Mutex<()>,
}

impl PreviewCache {
    pub async fn open(root: impl Into<PathBuf>, max_age_secs: f64) -> PreviewResult<PreviewCache> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await.context(IoSnafu)?;
        Ok(PreviewCache {
            root,
            max_age_secs,
            sweep_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, event_id: &EventId, dimension: u32) -> PathBuf {
        self.root.join(format!("{event_id}-{dimension}.jpg"))
    }

    /// Cached preview for an event at (rounded) dimension, if fresh.
    /// A stale file (the event was modified since) is removed on sight.
    pub async fn lookup(
        &self,
        event_id: &EventId,
        requested_dimension: u32,
        event_modified: Timestamp,
    ) -> PreviewResult<Option<PathBuf>> {
        let dimension = round_up_dimension(requested_dimension);
        let path = self.path_for(event_id, dimension);

        let fresh = tokio::task::block_in_place(|| -> PreviewResult<Option<bool>> {
            if !path.exists() {
                return Ok(None);
            }
            let cached_key = read_time_attr(&path, XATTR_EVENT_MODIFIED)?;
            Ok(Some(cached_key == Some(event_modified.as_secs())))
        })?;

        match fresh {
            None => Ok(None),
            Some(false) => {
                debug!(target: LOG_TARGET, path = %path.display(), "Dropping stale preview");
                tokio::fs::remove_file(&path).await.context(IoSnafu)?;
                Ok(None)
            }
            Some(true) => {
                tokio::task::block_in_place(|| {
                    write_time_attr(&path, XATTR_LAST_ACCESSED, Timestamp::now().as_secs())
                })?;
                Ok(Some(path))
            }
        }
    }

    /// Store preview bytes, stamping both attributes.
    pub async fn store(
        &self,
        event_id: &EventId,
        requested_dimension: u32,
        event_modified: Timestamp,
        bytes: &[u8],
    ) -> PreviewResult<PathBuf> {
        let dimension = round_up_dimension(requested_dimension);
        let path = self.path_for(event_id, dimension);
        tokio::fs::write(&path, bytes).await.context(IoSnafu)?;
        tokio::task::block_in_place(|| {
            write_time_attr(&path, XATTR_EVENT_MODIFIED, event_modified.as_secs())?;
            write_time_attr(&path, XATTR_LAST_ACCESSED, Timestamp::now().as_secs())
        })?;
        Ok(path)
    }

    /// Remove previews unused for longer than the configured age. At most
    /// one sweep runs at a time; per-file errors are logged and skipped.
    pub async fn sweep(&self) -> PreviewResult<SweepStats> {
        let _guard = self.sweep_lock.lock().await;
        let cutoff = Timestamp::now().sub_secs(self.max_age_secs);
        let mut stats = SweepStats::default();

        let mut entries = tokio::fs::read_dir(&self.root).await.context(IoSnafu)?;
        while let Some(entry) = entries.next_entry().await.context(IoSnafu)? {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            stats.scanned += 1;

            let last_accessed =
                tokio::task::block_in_place(|| read_time_attr(&path, XATTR_LAST_ACCESSED));
            match last_accessed {
                Ok(Some(last)) if Timestamp::from_secs(last).is_before(cutoff) => {
                    match tokio::fs::remove_file(&path).await {
                        Ok(()) => stats.removed += 1,
                        Err(err) => {
                            warn!(target: LOG_TARGET, path = %path.display(), %err, "Sweep could not remove file");
                            stats.skipped_on_error += 1;
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(target: LOG_TARGET, path = %path.display(), %err, "Sweep could not read attributes");
                    stats.skipped_on_error += 1;
                }
            }
            tokio::task::yield_now().await;
        }

        debug!(
            target: LOG_TARGET,
            scanned = stats.scanned,
            removed = stats.removed,
            "Preview sweep done"
        );
        Ok(stats)
    }
}

fn read_time_attr(path: &Path, name: &str) -> PreviewResult<Option<f64>> {
    let raw = xattr::get(path, name).context(IoSnafu)?;
    Ok(raw
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .and_then(|text| text.parse().ok()))
}

fn write_time_attr(path: &Path, name: &str, value: f64) -> PreviewResult<()> {
    xattr::set(path, name, format!("{value}").as_bytes()).context(IoSnafu)
}
