//! Background maintenance: session sweep and tombstone retention.

use std::time::Duration;

use tessera_core::Timestamp;
use tracing::{debug, warn};

use crate::{LOG_TARGET, SharedState};

const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

pub(crate) fn spawn(state: SharedState) {
    tokio::spawn(run(state));
}

async fn run(state: SharedState) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        sweep_once(&state).await;
    }
}

async fn sweep_once(state: &SharedState) {
    let now = Timestamp::now();

    match state
        .accounts
        .sweep_expired_sessions(now, state.config.auth.session_max_age_secs)
        .await
    {
        Ok(removed) if removed > 0 => {
            debug!(target: LOG_TARGET, removed, "Expired sessions swept");
        }
        Ok(_) => {}
        Err(err) => warn!(target: LOG_TARGET, %err, "Session sweep failed"),
    }

    // tombstones past the retention window are purged per user, yielding
    // between users so the sweep never monopolizes the pool
    let cutoff = now.sub_secs(state.config.storage.events_deletions_retention_secs);
    let users = match state.accounts.all_by_username().await {
        Ok(users) => users,
        Err(err) => {
            warn!(target: LOG_TARGET, %err, "Tombstone sweep could not list users");
            return;
        }
    };
    for (username, user_id) in users {
        let db = match state.user_dbs.get_or_open(&user_id).await {
            Ok(db) => db,
            Err(err) => {
                warn!(target: LOG_TARGET, %username, %err, "Tombstone sweep skipped user");
                continue;
            }
        };
        match db.purge_tombstones_before(cutoff).await {
            Ok(purged) if purged > 0 => {
                debug!(target: LOG_TARGET, %username, purged, "Purged expired tombstones");
            }
            Ok(_) => {}
            Err(err) => warn!(target: LOG_TARGET, %username, %err, "Tombstone purge failed"),
        }
        tokio::task::yield_now().await;
    }
}
