//! User lifecycle: registration and deletion.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use tracing::warn;

use super::AppJson;
use crate::context::{MethodContext, parse_auth};
use crate::registration::RegistrationParams;
use crate::routes::events::AuthQuery;
use crate::{LOG_TARGET, RequestResult, SharedState};

pub async fn register(
    State(state): State<SharedState>,
    AppJson(params): AppJson<RegistrationParams>,
) -> RequestResult<impl IntoResponse> {
    let outcome = state.register_user(params).await?;
    Ok((StatusCode::CREATED, AppJson(outcome)))
}

pub async fn delete_user(
    State(state): State<SharedState>,
    Path(username): Path<String>,
    headers: HeaderMap,
    Query(query): Query<AuthQuery>,
) -> RequestResult<impl IntoResponse> {
    let auth = parse_auth(&headers, query.auth());
    // `account.*` methods are personal-only
    let ctx = MethodContext::acquire(&state, &username, auth, "account.delete").await?;

    state.delete_user_local(&ctx.user_id, &username).await?;
    if let Err(err) = state.register.delete_user(&username, true).await {
        warn!(target: LOG_TARGET, %err, "Register-side user deletion failed");
    }

    Ok(AppJson(serde_json::json!({
        "userDeletion": { "username": username }
    })))
}
