//! Event store operations.

use rusqlite::{Connection, params, params_from_iter};
use snafu::ResultExt as _;
use tessera_core::Timestamp;
use tessera_core::event::Event;
use tessera_core::id::EventId;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::codec::{SELECT_COLUMNS, event_from_row, event_to_values};
use crate::query::{CompiledWhere, EventsQuery, QueryClause, compile_clauses};
use crate::schema::NON_KEY_COLUMNS;
use crate::{DbError, DbResult, LOG_TARGET, SqlSnafu, UNIVERSAL_TAG, UserEventDb};

/// Listing and streaming reads only ever see live events.
const LIVE_FILTER: &str = "deleted IS NULL AND headId IS NULL";

/// What [`UserEventDb::write_event_with_marker_takeover`] changed, for
/// compensation when a later step of the surrounding operation fails.
#[derive(Debug, Clone)]
pub struct MarkerWriteReceipt {
    /// Events the marker was stripped from.
    pub demoted: Vec<EventId>,
    /// The frozen pre-image row, when the write overwrote an existing
    /// event.
    pub frozen: Option<Event>,
}

fn insert_sql() -> String {
    let placeholders = vec!["?"; 1 + NON_KEY_COLUMNS.len()].join(", ");
    format!(
        "INSERT INTO events (eventid, {}) VALUES ({placeholders})",
        NON_KEY_COLUMNS.join(", "),
    )
}

fn update_sql() -> String {
    let assignments: Vec<String> = NON_KEY_COLUMNS.iter().map(|c| format!("{c} = ?")).collect();
    format!(
        "UPDATE events SET {} WHERE eventid = ?",
        assignments.join(", "),
    )
}

fn select_sql(compiled: &CompiledWhere, query: &EventsQuery, live_only: bool) -> String {
    let mut conditions = compiled.conditions.clone();
    if live_only {
        conditions.insert(0, LIVE_FILTER.to_owned());
    }
    let where_sql = if conditions.is_empty() {
        "1".to_owned()
    } else {
        conditions.join(" AND ")
    };
    let order = if query.sort_ascending { "ASC" } else { "DESC" };
    let limit = query.limit.map_or(-1i64, |l| l as i64);
    let skip = query.skip.unwrap_or(0);
    format!(
        "SELECT {SELECT_COLUMNS} FROM events WHERE {where_sql} \
         ORDER BY time {order} LIMIT {limit} OFFSET {skip}",
    )
}

impl UserEventDb {
    pub(crate) fn create_event_tx(conn: &Connection, event: &Event) -> DbResult<()> {
        let values = event_to_values(event)?;
        conn.execute(&insert_sql(), params_from_iter(values))
            .context(SqlSnafu)?;
        Ok(())
    }

    fn update_event_tx(conn: &Connection, event: &Event) -> DbResult<()> {
        let mut values = event_to_values(event)?;
        // move eventid last: it is the WHERE key, not an assignment
        let event_id = values.remove(0);
        values.push(event_id);
        let changed = conn
            .execute(&update_sql(), params_from_iter(values))
            .context(SqlSnafu)?;
        if changed != 1 {
            return Err(DbError::EventNotFound {
                event_id: event.id.to_string(),
            });
        }
        Ok(())
    }

    fn get_live_event_tx(conn: &Connection, event_id: &EventId) -> DbResult<Option<Event>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM events \
             WHERE eventid = ?1 AND {LIVE_FILTER}",
        );
        let mut stmt = conn.prepare_cached(&sql).context(SqlSnafu)?;
        let mut rows = stmt.query(params![event_id.as_str()]).context(SqlSnafu)?;
        match rows.next().context(SqlSnafu)? {
            Some(row) => Ok(Some(event_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub async fn create_event(&self, event: &Event) -> DbResult<()> {
        self.write_with(|conn| Self::create_event_tx(conn, event))
            .await
    }

    /// Live (non-deleted, non-history) event by id.
    pub async fn get_event(&self, event_id: &EventId) -> DbResult<Option<Event>> {
        self.read_with(|conn| Self::get_live_event_tx(conn, event_id))
            .await
    }

    /// Rewrite every non-key column of the row. The caller is responsible
    /// for having captured the pre-image first when history must be kept.
    pub async fn update_event(&self, event: &Event) -> DbResult<()> {
        self.write_with(|conn| Self::update_event_tx(conn, event))
            .await
    }

    /// Freeze the current version as a history row, then overwrite the live
    /// event, all in one transaction. Returns the frozen pre-image.
    pub async fn update_event_with_history(&self, updated: &Event) -> DbResult<Event> {
        self.write_with(|conn| {
            let Some(current) = Self::get_live_event_tx(conn, &updated.id)? else {
                return Err(DbError::EventNotFound {
                    event_id: updated.id.to_string(),
                });
            };
            let mut frozen = current.clone();
            frozen.id = EventId::generate();
            frozen.head_id = Some(updated.id.clone());
            Self::create_event_tx(conn, &frozen)?;
            Self::update_event_tx(conn, updated)?;
            Ok(frozen)
        })
        .await
    }

    pub async fn get_events(&self, query: &EventsQuery) -> DbResult<Vec<Event>> {
        self.read_with(|conn| Self::get_events_tx(conn, query))
            .await
    }

    pub(crate) fn get_events_tx(conn: &Connection, query: &EventsQuery) -> DbResult<Vec<Event>> {
        let compiled = compile_clauses(&query.clauses)?;
        let sql = select_sql(&compiled, query, true);
        let mut stmt = conn.prepare(&sql).context(SqlSnafu)?;
        let mut rows = stmt.query([]).context(SqlSnafu)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().context(SqlSnafu)? {
            out.push(event_from_row(row)?);
        }
        Ok(out)
    }

    pub async fn count_events(&self, clauses: &[QueryClause]) -> DbResult<u64> {
        self.read_with(|conn| {
            let compiled = compile_clauses(clauses)?;
            let sql = format!(
                "SELECT COUNT(*) FROM events WHERE {LIVE_FILTER} AND ({})",
                compiled.sql(),
            );
            conn.query_row(&sql, [], |row| row.get::<_, u64>(0))
                .context(SqlSnafu)
        })
        .await
    }

    /// Frozen previous versions of an event, oldest first.
    pub async fn get_history(&self, head_id: &EventId) -> DbResult<Vec<Event>> {
        self.read_with(|conn| {
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM events WHERE headId = ?1 ORDER BY modified ASC",
            );
            let mut stmt = conn.prepare_cached(&sql).context(SqlSnafu)?;
            let mut rows = stmt.query(params![head_id.as_str()]).context(SqlSnafu)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().context(SqlSnafu)? {
                out.push(event_from_row(row)?);
            }
            Ok(out)
        })
        .await
    }

    /// Blank out the payload columns of every history row of a head event,
    /// for privacy after the live event is gone. Returns the row count.
    pub async fn minimize_history(&self, head_id: &EventId) -> DbResult<usize> {
        self.write_with(|conn| {
            conn.execute(
                "UPDATE events SET content = NULL, description = NULL, clientData = NULL, \
                 attachments = NULL, integrity = NULL, streamIds = ?1 WHERE headId = ?2",
                params![UNIVERSAL_TAG, head_id.as_str()],
            )
            .context(SqlSnafu)
        })
        .await
    }

    /// Logical deletion: keep the row, stamp `deleted` and collapse the
    /// stream list to the universal tag.
    pub async fn tombstone_event(&self, event_id: &EventId, when: Timestamp) -> DbResult<()> {
        self.write_with(|conn| {
            let changed = conn
                .execute(
                    "UPDATE events SET deleted = ?1, streamIds = ?2, trashed = 0 \
                     WHERE eventid = ?3 AND deleted IS NULL",
                    params![when.as_secs(), UNIVERSAL_TAG, event_id.as_str()],
                )
                .context(SqlSnafu)?;
            if changed != 1 {
                return Err(DbError::EventNotFound {
                    event_id: event_id.to_string(),
                });
            }
            Ok(())
        })
        .await
    }

    /// Physical deletion of matching rows. With a stream condition the SQL
    /// dialect cannot DELETE across a MATCH, so matching ids are collected
    /// first and removed one by one inside the same transaction.
    pub async fn delete_by_query(&self, clauses: &[QueryClause]) -> DbResult<usize> {
        self.write_with(|conn| {
            let compiled = compile_clauses(clauses)?;
            if compiled.stream_match.is_none() {
                return conn
                    .execute(&format!("DELETE FROM events WHERE {}", compiled.sql()), [])
                    .context(SqlSnafu);
            }

            let sql = format!("SELECT eventid FROM events WHERE {}", compiled.sql());
            let mut stmt = conn.prepare(&sql).context(SqlSnafu)?;
            let ids: Vec<String> = stmt
                .query_map([], |row| row.get(0))
                .context(SqlSnafu)?
                .collect::<Result<_, _>>()
                .context(SqlSnafu)?;
            drop(stmt);

            debug!(target: LOG_TARGET, count = ids.len(), "Row-by-row delete");
            for id in &ids {
                conn.execute("DELETE FROM events WHERE eventid = ?1", params![id])
                    .context(SqlSnafu)?;
            }
            Ok(ids.len())
        })
        .await
    }

    /// Physically remove one row; test fixtures and TTL cleanup only.
    pub async fn purge_event(&self, event_id: &EventId) -> DbResult<()> {
        self.write_with(|conn| {
            conn.execute(
                "DELETE FROM events WHERE eventid = ?1",
                params![event_id.as_str()],
            )
            .context(SqlSnafu)?;
            Ok(())
        })
        .await
    }

    /// Drop tombstones whose deletion time is past the retention window,
    /// together with their history rows.
    pub async fn purge_tombstones_before(&self, cutoff: Timestamp) -> DbResult<usize> {
        self.write_with(|conn| {
            conn.execute(
                "DELETE FROM events WHERE headId IN \
                 (SELECT eventid FROM events WHERE deleted IS NOT NULL AND deleted < ?1)",
                params![cutoff.as_secs()],
            )
            .context(SqlSnafu)?;
            conn.execute(
                "DELETE FROM events WHERE deleted IS NOT NULL AND deleted < ?1",
                params![cutoff.as_secs()],
            )
            .context(SqlSnafu)
        })
        .await
    }

    /// Deletion tombstones newer than `since`, newest first.
    pub async fn get_deletions_since(&self, since: Timestamp) -> DbResult<Vec<Event>> {
        self.read_with(|conn| {
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM events \
                 WHERE deleted IS NOT NULL AND deleted >= ?1 ORDER BY deleted DESC",
            );
            let mut stmt = conn.prepare_cached(&sql).context(SqlSnafu)?;
            let mut rows = stmt.query(params![since.as_secs()]).context(SqlSnafu)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().context(SqlSnafu)? {
                out.push(event_from_row(row)?);
            }
            Ok(out)
        })
        .await
    }

    /// Lazy row stream over a throwaway read-only connection. Finite, not
    /// restartable; dropping the receiver stops the producer at the next
    /// send.
    pub async fn stream_events(
        &self,
        query: EventsQuery,
    ) -> DbResult<ReceiverStream<DbResult<Event>>> {
        let conn = self.open_streaming_conn()?;
        let (tx, rx) = tokio::sync::mpsc::channel(64);

        tokio::task::spawn_blocking(move || {
            let produce = || -> DbResult<()> {
                let compiled = compile_clauses(&query.clauses)?;
                let sql = select_sql(&compiled, &query, true);
                let mut stmt = conn.prepare(&sql).context(SqlSnafu)?;
                let mut rows = stmt.query([]).context(SqlSnafu)?;
                while let Some(row) = rows.next().context(SqlSnafu)? {
                    let event = event_from_row(row)?;
                    if tx.blocking_send(Ok(event)).is_err() {
                        // consumer hung up
                        return Ok(());
                    }
                }
                Ok(())
            };
            if let Err(err) = produce() {
                warn!(target: LOG_TARGET, %err, "Streaming read failed");
                let _ = tx.blocking_send(Err(err));
            }
        });

        Ok(ReceiverStream::new(rx))
    }

    /// Rewrite only the stream-id list of a row (marker moves, rollbacks).
    pub async fn rewrite_stream_ids(
        &self,
        event_id: &EventId,
        stream_ids: &[tessera_core::stream::StreamId],
    ) -> DbResult<()> {
        let joined = crate::codec::join_stream_ids(stream_ids);
        self.write_with(|conn| {
            let changed = conn
                .execute(
                    "UPDATE events SET streamIds = ?1 WHERE eventid = ?2",
                    params![joined, event_id.as_str()],
                )
                .context(SqlSnafu)?;
            if changed != 1 {
                return Err(DbError::EventNotFound {
                    event_id: event_id.to_string(),
                });
            }
            Ok(())
        })
        .await
    }

    /// Write an event that takes over a marker stream id: within one
    /// transaction, strip `marker` from every other live event carrying
    /// both `stream_id` and `marker`, then insert the new event (or freeze
    /// and overwrite the existing one). The returned receipt carries what a
    /// failed downstream step needs to undo everything.
    pub async fn write_event_with_marker_takeover(
        &self,
        event: &Event,
        stream_id: &tessera_core::stream::StreamId,
        marker: &tessera_core::stream::StreamId,
        capture_history: bool,
    ) -> DbResult<MarkerWriteReceipt> {
        self.write_with(|conn| {
            let mut demoted = Vec::new();
            let holders = Self::get_events_tx(
                conn,
                &EventsQuery::new(vec![QueryClause::StreamsQuery {
                    query: crate::query::StreamQuery(vec![crate::query::AndBlock(vec![
                        crate::query::StreamQueryItem::Any(vec![stream_id.as_str().to_owned()]),
                        crate::query::StreamQueryItem::Any(vec![marker.as_str().to_owned()]),
                    ])]),
                }]),
            )?;
            for holder in holders {
                if holder.id == event.id {
                    continue;
                }
                let remaining: Vec<tessera_core::stream::StreamId> = holder
                    .stream_ids
                    .iter()
                    .filter(|s| *s != marker)
                    .cloned()
                    .collect();
                let joined = crate::codec::join_stream_ids(&remaining);
                conn.execute(
                    "UPDATE events SET streamIds = ?1 WHERE eventid = ?2",
                    params![joined, holder.id.as_str()],
                )
                .context(SqlSnafu)?;
                demoted.push(holder.id);
            }

            let frozen = if capture_history {
                let Some(current) = Self::get_live_event_tx(conn, &event.id)? else {
                    return Err(DbError::EventNotFound {
                        event_id: event.id.to_string(),
                    });
                };
                let mut frozen = current;
                frozen.id = EventId::generate();
                frozen.head_id = Some(event.id.clone());
                Self::create_event_tx(conn, &frozen)?;
                Self::update_event_tx(conn, event)?;
                Some(frozen)
            } else {
                Self::create_event_tx(conn, event)?;
                None
            };
            Ok(MarkerWriteReceipt { demoted, frozen })
        })
        .await
    }

    /// Stream-id tokens known to the full-text index, filtered with a SQL
    /// LIKE pattern. Powers term enumeration (e.g. listing audit streams).
    pub async fn terms_matching(&self, like_pattern: &str) -> DbResult<Vec<String>> {
        self.read_with(|conn| {
            let mut stmt = conn
                .prepare_cached("SELECT term FROM events_fts_v WHERE term LIKE ?1 ORDER BY term")
                .context(SqlSnafu)?;
            stmt.query_map(params![like_pattern], |row| row.get(0))
                .context(SqlSnafu)?
                .collect::<Result<_, _>>()
                .context(SqlSnafu)
        })
        .await
    }

    /// All live events carrying the given stream id. Convenience used by
    /// account attribute lookups.
    pub async fn get_events_on_stream(&self, stream_id: &str) -> DbResult<Vec<Event>> {
        let query = EventsQuery::new(vec![QueryClause::StreamsQuery {
            query: crate::query::StreamQuery::any_of([stream_id]),
        }]);
        self.get_events(&query).await
    }

    /// Stored stream-id string for one row, terminator included; used by
    /// tests and integrity checks.
    #[doc(hidden)]
    pub async fn raw_stream_ids(&self, event_id: &EventId) -> DbResult<Option<String>> {
        self.read_with(|conn| {
            let mut stmt = conn
                .prepare_cached("SELECT streamIds FROM events WHERE eventid = ?1")
                .context(SqlSnafu)?;
            let mut rows = stmt
                .query_map(params![event_id.as_str()], |row| row.get::<_, String>(0))
                .context(SqlSnafu)?;
            match rows.next() {
                Some(row) => Ok(Some(row.context(SqlSnafu)?)),
                None => Ok(None),
            }
        })
        .await
    }
}
