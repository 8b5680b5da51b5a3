//! Session creation and teardown.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use serde::Deserialize;
use tessera_core::{ApiError, Timestamp};

use super::AppJson;
use crate::context::{MethodContext, parse_auth};
use crate::routes::events::AuthQuery;
use crate::{RequestResult, SharedState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginParams {
    pub username: String,
    pub password: String,
    pub app_id: String,
}

pub async fn login(
    State(state): State<SharedState>,
    Path(username): Path<String>,
    AppJson(params): AppJson<LoginParams>,
) -> RequestResult<impl IntoResponse> {
    if params.username != username {
        return Err(
            ApiError::invalid_parameters("Body and path usernames do not match").into(),
        );
    }

    let Some(user_id) = state.accounts.get_user_id(&username).await? else {
        return Err(ApiError::UnknownResource {
            resource: "user",
            id: username.clone(),
        }
        .into());
    };

    if !state.accounts.verify_password(&user_id, &params.password).await? {
        return Err(ApiError::invalid_access_token("Invalid username or password").into());
    }

    let now = Timestamp::now();
    let token = state.accounts.create_session(&username, &params.app_id).await?;

    // the personal access carries the session token; one per app id
    let live = state.accounts.list_accesses(&user_id, false).await?;
    let personal = live.into_iter().find(|a| {
        a.access_type == tessera_core::access::AccessType::Personal && a.name == params.app_id
    });
    match personal {
        Some(mut access) => {
            if let Some(old_token) = &access.token {
                state.access_cache_evict(&format!("{user_id}\n{old_token}"));
                state.accounts.delete_session(old_token).await?;
            }
            access.token = Some(token.clone());
            access.modified = now;
            access.modified_by = access.id.to_string();
            state.accounts.store_access(&user_id, &access).await?;
        }
        None => {
            let id = tessera_core::id::AccessId::generate();
            let access = tessera_core::access::Access {
                id: id.clone(),
                token: Some(token.clone()),
                access_type: tessera_core::access::AccessType::Personal,
                name: params.app_id.clone(),
                device_name: None,
                permissions: vec![],
                calls: Default::default(),
                created: now,
                created_by: id.to_string(),
                modified: now,
                modified_by: id.to_string(),
                expires: None,
                deleted: None,
                integrity: None,
            };
            state.accounts.store_access(&user_id, &access).await?;
        }
    }

    Ok(AppJson(serde_json::json!({
        "token": token,
        "apiEndpoint": state.api_endpoint_for(&username),
    })))
}

pub async fn logout(
    State(state): State<SharedState>,
    Path(username): Path<String>,
    headers: HeaderMap,
    Query(query): Query<AuthQuery>,
) -> RequestResult<impl IntoResponse> {
    let auth = parse_auth(&headers, query.auth());
    let token = auth.as_ref().map(|a| a.token.clone());
    let ctx = MethodContext::acquire(&state, &username, auth, "auth.logout").await?;

    if !ctx.access.is_personal() {
        return Err(ApiError::forbidden("Only personal tokens have sessions").into());
    }
    if let Some(token) = token {
        state.accounts.delete_session(&token).await?;
        state.access_cache_evict(&format!("{}\n{token}", ctx.user_id));
    }
    Ok(AppJson(serde_json::json!({})))
}
