//! Event methods.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use serde::Deserialize;
use tessera_core::event::Event;
use tessera_core::id::EventId;
use tessera_core::stream::StreamId;
use tessera_core::{ApiError, Timestamp};
use tessera_user_db::query::{Field, Operand};
use tessera_user_db::{AndBlock, EventsQuery, QueryClause, StreamQuery, StreamQueryItem};

use super::AppJson;
use crate::account_events::AccountWrite;
use crate::context::{MethodContext, parse_auth};
use crate::{RequestResult, SharedState};

/// Listings return at most this many events unless the caller asks.
const DEFAULT_LIMIT: u64 = 20;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListParams {
    auth: Option<String>,
    from_time: Option<f64>,
    to_time: Option<f64>,
    /// JSON: a flat id list, one AND-block, or full DNF.
    streams: Option<String>,
    /// Comma-separated; `class/*` widens to the whole class.
    types: Option<String>,
    modified_since: Option<f64>,
    sort_ascending: Option<bool>,
    skip: Option<u64>,
    limit: Option<u64>,
    /// `default` (live), `trashed`, or `all`.
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEventParams {
    #[serde(default)]
    pub stream_ids: Option<Vec<StreamId>>,
    #[serde(default)]
    pub stream_id: Option<StreamId>,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub content: Option<serde_json::Value>,
    #[serde(default)]
    pub time: Option<f64>,
    #[serde(default)]
    pub end_time: Option<f64>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub client_data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEventParams {
    #[serde(default)]
    pub stream_ids: Option<Vec<StreamId>>,
    #[serde(rename = "type", default)]
    pub event_type: Option<String>,
    #[serde(default, with = "double_option")]
    pub content: Option<Option<serde_json::Value>>,
    #[serde(default)]
    pub time: Option<f64>,
    #[serde(default, with = "double_option")]
    pub end_time: Option<Option<f64>>,
    #[serde(default, with = "double_option")]
    pub description: Option<Option<String>>,
    #[serde(default, with = "double_option")]
    pub client_data: Option<Option<serde_json::Value>>,
    #[serde(default)]
    pub trashed: Option<bool>,
}

/// Distinguishes "field absent" from "field set to null" on updates.
mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct AuthQuery {
    auth: Option<String>,
}

impl AuthQuery {
    pub fn auth(&self) -> Option<&str> {
        self.auth.as_deref()
    }
}

fn parse_streams_param(raw: &str) -> Result<StreamQuery, ApiError> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|err| ApiError::invalid_parameters(format!("Bad `streams` parameter: {err}")))?;

    let Some(items) = value.as_array() else {
        return Err(ApiError::invalid_parameters(
            "`streams` must be a JSON array",
        ));
    };
    if items.is_empty() {
        return Ok(StreamQuery::default());
    }

    // flat id list
    if items.iter().all(|v| v.is_string()) {
        let ids: Vec<String> = items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_owned))
            .collect();
        return Ok(StreamQuery::any_of(ids));
    }
    // one AND-block of {any}/{not} items
    if items.iter().all(|v| v.is_object()) {
        let block: AndBlock = serde_json::from_value(value.clone())
            .map_err(|err| ApiError::invalid_parameters(format!("Bad stream query: {err}")))?;
        return Ok(StreamQuery(vec![block]));
    }
    // full DNF
    serde_json::from_value(value)
        .map_err(|err| ApiError::invalid_parameters(format!("Bad stream query: {err}")))
}

/// Stream ids whose events this access must never see; appended as a NOT
/// item to every AND-block.
fn hidden_stream_ids(state: &SharedState, ctx: &MethodContext) -> Vec<String> {
    let mut hidden: Vec<String> = state
        .catalog
        .forbidden_for_reading()
        .map(str::to_owned)
        .collect();
    if !ctx.access.is_personal() {
        for stream in state.catalog.all_account() {
            let id = StreamId::new(stream.id.clone());
            if !ctx.access.can_get_events_on_stream(&id) && !hidden.contains(&stream.id) {
                hidden.push(stream.id.clone());
            }
        }
    }
    hidden
}

/// An event is visible only when every non-marker stream it sits on is
/// readable: one forbidden or ungranted id hides the whole event. This is
/// the single-event counterpart of the NOT-filter listings push into SQL —
/// an event must not leak through a readable stream because it also carries
/// an unreadable one.
fn visible(state: &SharedState, ctx: &MethodContext, event: &Event) -> bool {
    let mut readable_streams = 0;
    for stream_id in &event.stream_ids {
        if stream_id.is_marker() {
            continue;
        }
        if state
            .catalog
            .forbidden_for_reading()
            .any(|forbidden| forbidden == stream_id.as_str())
        {
            return false;
        }
        if !ctx.access.can_get_events_on_stream(stream_id) {
            return false;
        }
        readable_streams += 1;
    }
    // tombstones and marker-only lists carry nothing readable
    readable_streams > 0
}

fn build_query(
    state: &SharedState,
    ctx: &MethodContext,
    params: &ListParams,
) -> Result<EventsQuery, ApiError> {
    let mut clauses = Vec::new();

    match params.state.as_deref() {
        None | Some("default") => clauses.push(QueryClause::Equal {
            field: Field::Trashed,
            value: Operand::Bool(false),
        }),
        Some("trashed") => clauses.push(QueryClause::Equal {
            field: Field::Trashed,
            value: Operand::Bool(true),
        }),
        Some("all") => {}
        Some(other) => {
            return Err(ApiError::invalid_parameters(format!(
                "Unknown state `{other}`"
            )));
        }
    }

    if let Some(from_time) = params.from_time {
        // events still running or ending after `fromTime` overlap the range
        clauses.push(QueryClause::GreaterOrEqualOrNull {
            field: Field::EndTime,
            value: Operand::Number(from_time),
        });
    }
    if let Some(to_time) = params.to_time {
        clauses.push(QueryClause::LowerOrEqual {
            field: Field::Time,
            value: Operand::Number(to_time),
        });
    }
    if let Some(modified_since) = params.modified_since {
        clauses.push(QueryClause::Greater {
            field: Field::Modified,
            value: Operand::Number(modified_since),
        });
    }
    if let Some(types) = &params.types {
        let types: Vec<String> = types
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_owned)
            .collect();
        if !types.is_empty() {
            clauses.push(QueryClause::TypesList { types });
        }
    }

    let mut stream_query = match &params.streams {
        Some(raw) => parse_streams_param(raw)?,
        None => StreamQuery::default(),
    };

    let hidden = hidden_stream_ids(state, ctx);
    let forced: Vec<String> = ctx
        .access
        .forced_streams()
        .iter()
        .map(|s| s.as_str().to_owned())
        .collect();

    if !hidden.is_empty() || !forced.is_empty() {
        if stream_query.0.is_empty() {
            stream_query.0.push(AndBlock(vec![]));
        }
        for block in &mut stream_query.0 {
            if !forced.is_empty() {
                block.0.push(StreamQueryItem::Any(forced.clone()));
            }
            if !hidden.is_empty() {
                block.0.push(StreamQueryItem::Not(hidden.clone()));
            }
        }
    }
    if !stream_query.is_empty() {
        clauses.push(QueryClause::StreamsQuery {
            query: stream_query,
        });
    }

    Ok(EventsQuery {
        clauses,
        sort_ascending: params.sort_ascending.unwrap_or(false),
        limit: None,
        skip: None,
    })
}

pub async fn list(
    State(state): State<SharedState>,
    Path(username): Path<String>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> RequestResult<impl IntoResponse> {
    let auth = parse_auth(&headers, params.auth.as_deref());
    let ctx = MethodContext::acquire(&state, &username, auth, "events.get").await?;

    let query = build_query(&state, &ctx, &params)?;
    let db = state.user_dbs.get_or_open(&ctx.user_id).await?;
    let events = db.get_events(&query).await?;

    let skip = params.skip.unwrap_or(0) as usize;
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT) as usize;
    let events: Vec<Event> = events
        .into_iter()
        .filter(|event| visible(&state, &ctx, event))
        .skip(skip)
        .take(limit)
        .collect();

    Ok(AppJson(serde_json::json!({ "events": events })))
}

pub async fn get_one(
    State(state): State<SharedState>,
    Path((username, event_id)): Path<(String, String)>,
    headers: HeaderMap,
    Query(query): Query<AuthQuery>,
) -> RequestResult<impl IntoResponse> {
    let auth = parse_auth(&headers, query.auth.as_deref());
    let ctx = MethodContext::acquire(&state, &username, auth, "events.getOne").await?;

    let event_id = parse_event_id(&event_id)?;
    let db = state.user_dbs.get_or_open(&ctx.user_id).await?;
    let Some(event) = db.get_event(&event_id).await? else {
        return Err(unknown_event(&event_id).into());
    };
    if !visible(&state, &ctx, &event) {
        return Err(ApiError::forbidden("This access cannot read this event").into());
    }
    Ok(AppJson(serde_json::json!({ "event": event })))
}

pub async fn create(
    State(state): State<SharedState>,
    Path(username): Path<String>,
    headers: HeaderMap,
    Query(query): Query<AuthQuery>,
    AppJson(params): AppJson<NewEventParams>,
) -> RequestResult<impl IntoResponse> {
    let auth = parse_auth(&headers, query.auth.as_deref());
    let ctx = MethodContext::acquire(&state, &username, auth, "events.create").await?;
    let now = Timestamp::now();

    let stream_ids = match (params.stream_ids, params.stream_id) {
        (Some(ids), _) if !ids.is_empty() => ids,
        (_, Some(id)) => vec![id],
        _ => {
            return Err(
                ApiError::invalid_parameters("Missing `streamIds` (or `streamId`)").into(),
            );
        }
    };
    check_streams_known(&state, &stream_ids)?;
    for stream_id in stream_ids.iter().filter(|s| !s.is_marker()) {
        if !ctx.access.can_create_events_on_stream(stream_id) {
            return Err(ApiError::forbidden(format!(
                "This access cannot create events on `{stream_id}`"
            ))
            .into());
        }
    }

    let mut event = Event {
        id: tessera_core::id::EventId::generate(),
        stream_ids,
        event_type: params.event_type,
        content: params.content,
        time: Timestamp::from_secs(params.time.unwrap_or_else(|| now.as_secs())),
        end_time: params.end_time.map(Timestamp::from_secs),
        created: now,
        created_by: String::new(),
        modified: now,
        modified_by: String::new(),
        trashed: false,
        deleted: None,
        head_id: None,
        integrity: None,
        attachments: vec![],
        description: params.description,
        client_data: params.client_data,
    };
    ctx.init_tracking(&mut event, now);

    match state.account_leaf_for(&event.stream_ids)? {
        Some(stream) => {
            let stream = stream.clone();
            event
                .check_well_formed()
                .map_err(ApiError::invalid_parameters)?;
            state
                .write_account_event(&ctx.user_id, &username, &mut event, &stream, AccountWrite::Create)
                .await?;
        }
        None => {
            event
                .check_well_formed()
                .map_err(ApiError::invalid_parameters)?;
            let db = state.user_dbs.get_or_open(&ctx.user_id).await?;
            db.create_event(&event).await?;
        }
    }

    Ok((
        StatusCode::CREATED,
        AppJson(serde_json::json!({ "event": event })),
    ))
}

pub async fn update(
    State(state): State<SharedState>,
    Path((username, event_id)): Path<(String, String)>,
    headers: HeaderMap,
    Query(query): Query<AuthQuery>,
    AppJson(params): AppJson<UpdateEventParams>,
) -> RequestResult<impl IntoResponse> {
    let auth = parse_auth(&headers, query.auth.as_deref());
    let ctx = MethodContext::acquire(&state, &username, auth, "events.update").await?;
    let now = Timestamp::now();

    let event_id = parse_event_id(&event_id)?;
    let db = state.user_dbs.get_or_open(&ctx.user_id).await?;
    let Some(existing) = db.get_event(&event_id).await? else {
        return Err(unknown_event(&event_id).into());
    };

    for stream_id in existing.stream_ids.iter().filter(|s| !s.is_marker()) {
        if !ctx.access.can_update_events_on_stream(stream_id) {
            return Err(ApiError::forbidden(format!(
                "This access cannot update events on `{stream_id}`"
            ))
            .into());
        }
    }

    let mut updated = existing.clone();
    if let Some(stream_ids) = params.stream_ids {
        check_streams_known(&state, &stream_ids)?;
        for stream_id in stream_ids.iter().filter(|s| !s.is_marker()) {
            if !ctx.access.can_update_events_on_stream(stream_id) {
                return Err(ApiError::forbidden(format!(
                    "This access cannot move events onto `{stream_id}`"
                ))
                .into());
            }
        }
        updated.stream_ids = stream_ids;
    }
    if let Some(event_type) = params.event_type {
        updated.event_type = event_type;
    }
    if let Some(content) = params.content {
        updated.content = content;
    }
    if let Some(time) = params.time {
        updated.time = Timestamp::from_secs(time);
    }
    if let Some(end_time) = params.end_time {
        updated.end_time = end_time.map(Timestamp::from_secs);
    }
    if let Some(description) = params.description {
        updated.description = description;
    }
    if let Some(client_data) = params.client_data {
        updated.client_data = client_data;
    }
    if let Some(trashed) = params.trashed {
        updated.trashed = trashed;
    }
    ctx.update_tracking(&mut updated, now);

    let old_leaf = state.account_leaf_for(&existing.stream_ids)?.cloned();
    let new_leaf = state.account_leaf_for(&updated.stream_ids)?.cloned();
    match (&old_leaf, &new_leaf) {
        (Some(old), Some(new)) if old.id == new.id => {
            updated
                .check_well_formed()
                .map_err(ApiError::invalid_parameters)?;
            state
                .write_account_event(
                    &ctx.user_id,
                    &username,
                    &mut updated,
                    new,
                    AccountWrite::Update,
                )
                .await?;
        }
        (None, None) => {
            updated
                .check_well_formed()
                .map_err(ApiError::invalid_parameters)?;
            db.update_event_with_history(&updated).await?;
        }
        _ => {
            return Err(ApiError::invalid_operation(
                "An event cannot move onto or off an account stream",
            )
            .into());
        }
    }

    Ok(AppJson(serde_json::json!({ "event": updated })))
}

pub async fn delete(
    State(state): State<SharedState>,
    Path((username, event_id)): Path<(String, String)>,
    headers: HeaderMap,
    Query(query): Query<AuthQuery>,
) -> RequestResult<impl IntoResponse> {
    let auth = parse_auth(&headers, query.auth.as_deref());
    let ctx = MethodContext::acquire(&state, &username, auth, "events.delete").await?;
    let now = Timestamp::now();

    let event_id = parse_event_id(&event_id)?;
    let db = state.user_dbs.get_or_open(&ctx.user_id).await?;
    let Some(existing) = db.get_event(&event_id).await? else {
        return Err(unknown_event(&event_id).into());
    };

    for stream_id in existing.stream_ids.iter().filter(|s| !s.is_marker()) {
        if !ctx.access.can_delete_events_on_stream(stream_id) {
            return Err(ApiError::forbidden(format!(
                "This access cannot delete events on `{stream_id}`"
            ))
            .into());
        }
    }

    let leaf = state.account_leaf_for(&existing.stream_ids)?.cloned();
    if let Some(stream) = &leaf {
        // the authoritative account value is protected at both stages
        if existing
            .stream_ids
            .iter()
            .any(|s| s.as_str() == tessera_core::stream::ACTIVE_MARKER)
        {
            return Err(ApiError::invalid_operation(format!(
                "The active `{}` value cannot be deleted; supersede it instead",
                stream.unprefixed_id(),
            ))
            .into());
        }
    }

    if !existing.trashed {
        let mut trashed = existing.clone();
        trashed.trashed = true;
        ctx.update_tracking(&mut trashed, now);
        db.update_event_with_history(&trashed).await?;
        return Ok(AppJson(serde_json::json!({ "event": trashed })).into_response());
    }

    match &leaf {
        Some(stream) => {
            state
                .delete_account_event(&ctx.user_id, &username, &existing, stream, now)
                .await?;
        }
        None => {
            db.tombstone_event(&event_id, now).await?;
            db.minimize_history(&event_id).await?;
        }
    }

    Ok(AppJson(serde_json::json!({
        "eventDeletion": { "id": event_id, "deleted": now }
    }))
    .into_response())
}

fn parse_event_id(raw: &str) -> Result<EventId, ApiError> {
    raw.parse().map_err(|_| ApiError::InvalidItemId {
        message: format!("Malformed event id `{raw}`"),
    })
}

fn unknown_event(event_id: &EventId) -> ApiError {
    ApiError::UnknownResource {
        resource: "event",
        id: event_id.to_string(),
    }
}

/// Store-prefixed stream ids must name a known system stream; bare local
/// ids are free-form.
fn check_streams_known(state: &SharedState, stream_ids: &[StreamId]) -> Result<(), ApiError> {
    for stream_id in stream_ids {
        if stream_id.as_str().starts_with(':')
            && state.catalog.get_for_read(stream_id.as_str()).is_none()
        {
            return Err(ApiError::UnknownResource {
                resource: "stream",
                id: stream_id.to_string(),
            });
        }
    }
    Ok(())
}
