//! Physical schema of a user event database.
//!
//! The `events` table is the single source of truth; `events_fts` mirrors
//! its `streamIds` column (external-content FTS5, kept in sync by
//! triggers), and `events_fts_v` is the vocabulary view used to enumerate
//! known stream-id tokens.

use rusqlite::Connection;

/// Columns rewritten by a full-row UPDATE, in stable order. `eventid` is the
/// key and never changes.
pub(crate) const NON_KEY_COLUMNS: &[&str] = &[
    "headId",
    "streamIds",
    "time",
    "endTime",
    "deleted",
    "type",
    "content",
    "description",
    "clientData",
    "integrity",
    "attachments",
    "trashed",
    "created",
    "createdBy",
    "modified",
    "modifiedBy",
];

const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS events (
  eventid TEXT UNIQUE NOT NULL,
  headId TEXT,
  streamIds TEXT NOT NULL,
  time REAL,
  endTime REAL,
  deleted REAL,
  type TEXT,
  content TEXT,
  description TEXT,
  clientData TEXT,
  integrity TEXT,
  attachments TEXT,
  trashed INTEGER NOT NULL DEFAULT 0,
  created REAL,
  createdBy TEXT,
  modified REAL,
  modifiedBy TEXT
);

CREATE INDEX IF NOT EXISTS idx_events_time ON events(time);
CREATE INDEX IF NOT EXISTS idx_events_endTime ON events(endTime);
CREATE INDEX IF NOT EXISTS idx_events_deleted ON events(deleted);
CREATE INDEX IF NOT EXISTS idx_events_type ON events(type);
CREATE INDEX IF NOT EXISTS idx_events_trashed ON events(trashed);
CREATE INDEX IF NOT EXISTS idx_events_created ON events(created);
CREATE INDEX IF NOT EXISTS idx_events_createdBy ON events(createdBy);
CREATE INDEX IF NOT EXISTS idx_events_modified ON events(modified);
CREATE INDEX IF NOT EXISTS idx_events_modifiedBy ON events(modifiedBy);
CREATE INDEX IF NOT EXISTS idx_events_headId ON events(headId);

CREATE VIRTUAL TABLE IF NOT EXISTS events_fts USING fts5(
  streamIds,
  content='events',
  content_rowid='rowid',
  tokenize="unicode61 tokenchars '-_:.'"
);

CREATE TRIGGER IF NOT EXISTS events_fts_insert AFTER INSERT ON events BEGIN
  INSERT INTO events_fts(rowid, streamIds) VALUES (new.rowid, new.streamIds);
END;

CREATE TRIGGER IF NOT EXISTS events_fts_delete AFTER DELETE ON events BEGIN
  INSERT INTO events_fts(events_fts, rowid, streamIds)
    VALUES ('delete', old.rowid, old.streamIds);
END;

CREATE TRIGGER IF NOT EXISTS events_fts_update AFTER UPDATE ON events BEGIN
  INSERT INTO events_fts(events_fts, rowid, streamIds)
    VALUES ('delete', old.rowid, old.streamIds);
  INSERT INTO events_fts(rowid, streamIds) VALUES (new.rowid, new.streamIds);
END;

CREATE VIRTUAL TABLE IF NOT EXISTS events_fts_v USING fts5vocab('events_fts', 'row');
"#;

pub(crate) fn init(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(DDL)
}
