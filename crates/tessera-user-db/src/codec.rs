//! Row ↔ event conversion.

use rusqlite::Row;
use rusqlite::types::Value;
use snafu::ResultExt as _;
use tessera_core::Timestamp;
use tessera_core::event::Event;
use tessera_core::id::EventId;
use tessera_core::stream::StreamId;

use crate::{DbResult, RowSnafu, SqlSnafu, UNIVERSAL_TAG};

/// Column list every row read goes through, `eventid` first then the
/// non-key columns in [`crate::schema::NON_KEY_COLUMNS`] order.
pub(crate) const SELECT_COLUMNS: &str = "eventid, headId, streamIds, time, endTime, deleted, \
     type, content, description, clientData, integrity, attachments, \
     trashed, created, createdBy, modified, modifiedBy";

/// Space-join stream ids and terminate with the universal tag, so a
/// "match-all" stream query has a token to match. A tombstone's list is the
/// tag alone.
pub(crate) fn join_stream_ids(ids: &[StreamId]) -> String {
    let mut out = String::new();
    for id in ids {
        out.push_str(id.as_str());
        out.push(' ');
    }
    out.push_str(UNIVERSAL_TAG);
    out
}

pub(crate) fn split_stream_ids(joined: &str) -> Vec<StreamId> {
    joined
        .split_ascii_whitespace()
        .filter(|token| *token != UNIVERSAL_TAG)
        .map(StreamId::from)
        .collect()
}

fn json_column<T: serde::Serialize>(value: &T) -> DbResult<Value> {
    let text = serde_json::to_string(value).map_err(|err| {
        RowSnafu {
            message: format!("unserializable JSON column: {err}"),
        }
        .build()
    })?;
    Ok(Value::Text(text))
}

fn opt_text(value: Option<&str>) -> Value {
    match value {
        Some(s) => Value::Text(s.to_owned()),
        None => Value::Null,
    }
}

fn opt_time(value: Option<Timestamp>) -> Value {
    match value {
        Some(t) => Value::Real(t.as_secs()),
        None => Value::Null,
    }
}

/// Values for one row, `eventid` first, then the non-key columns in order.
pub(crate) fn event_to_values(event: &Event) -> DbResult<Vec<Value>> {
    Ok(vec![
        Value::Text(event.id.to_string()),
        opt_text(event.head_id.as_ref().map(|id| id.as_str())),
        Value::Text(join_stream_ids(&event.stream_ids)),
        Value::Real(event.time.as_secs()),
        opt_time(event.end_time),
        opt_time(event.deleted),
        Value::Text(event.event_type.clone()),
        match &event.content {
            Some(content) => json_column(content)?,
            None => Value::Null,
        },
        opt_text(event.description.as_deref()),
        match &event.client_data {
            Some(data) => json_column(data)?,
            None => Value::Null,
        },
        opt_text(event.integrity.as_deref()),
        if event.attachments.is_empty() {
            Value::Null
        } else {
            json_column(&event.attachments)?
        },
        Value::Integer(i64::from(event.trashed)),
        Value::Real(event.created.as_secs()),
        Value::Text(event.created_by.clone()),
        Value::Real(event.modified.as_secs()),
        Value::Text(event.modified_by.clone()),
    ])
}

fn parse_json<T: serde::de::DeserializeOwned>(
    column: &'static str,
    text: Option<String>,
) -> DbResult<Option<T>> {
    let Some(text) = text else { return Ok(None) };
    let parsed = serde_json::from_str(&text).map_err(|err| {
        RowSnafu {
            message: format!("bad JSON in `{column}`: {err}"),
        }
        .build()
    })?;
    Ok(Some(parsed))
}

fn parse_id(column: &'static str, text: &str) -> DbResult<EventId> {
    text.parse().map_err(|_| {
        RowSnafu {
            message: format!("bad id in `{column}`: `{text}`"),
        }
        .build()
    })
}

/// Unpack one row selected with [`SELECT_COLUMNS`].
pub(crate) fn event_from_row(row: &Row<'_>) -> DbResult<Event> {
    let event_id: String = row.get(0).context(SqlSnafu)?;
    let head_id: Option<String> = row.get(1).context(SqlSnafu)?;
    let stream_ids: String = row.get(2).context(SqlSnafu)?;
    let time: f64 = row.get(3).context(SqlSnafu)?;
    let end_time: Option<f64> = row.get(4).context(SqlSnafu)?;
    let deleted: Option<f64> = row.get(5).context(SqlSnafu)?;
    let event_type: String = row.get(6).context(SqlSnafu)?;
    let content: Option<String> = row.get(7).context(SqlSnafu)?;
    let description: Option<String> = row.get(8).context(SqlSnafu)?;
    let client_data: Option<String> = row.get(9).context(SqlSnafu)?;
    let integrity: Option<String> = row.get(10).context(SqlSnafu)?;
    let attachments: Option<String> = row.get(11).context(SqlSnafu)?;
    let trashed: i64 = row.get(12).context(SqlSnafu)?;
    let created: f64 = row.get(13).context(SqlSnafu)?;
    let created_by: String = row.get(14).context(SqlSnafu)?;
    let modified: f64 = row.get(15).context(SqlSnafu)?;
    let modified_by: String = row.get(16).context(SqlSnafu)?;

    Ok(Event {
        id: parse_id("eventid", &event_id)?,
        head_id: head_id
            .map(|id| parse_id("headId", &id))
            .transpose()?,
        stream_ids: split_stream_ids(&stream_ids),
        event_type,
        content: parse_json("content", content)?,
        time: Timestamp::from_secs(time),
        end_time: end_time.map(Timestamp::from_secs),
        deleted: deleted.map(Timestamp::from_secs),
        description,
        client_data: parse_json("clientData", client_data)?,
        integrity,
        attachments: parse_json("attachments", attachments)?.unwrap_or_default(),
        trashed: trashed != 0,
        created: Timestamp::from_secs(created),
        created_by,
        modified: Timestamp::from_secs(modified),
        modified_by,
    })
}
