//! Access management methods.

use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use serde::Deserialize;
use tessera_core::access::{Access, AccessType, Permission};
use tessera_core::id::AccessId;
use tessera_core::{ApiError, Timestamp};

use super::AppJson;
use crate::context::{MethodContext, parse_auth};
use crate::routes::events::AuthQuery;
use crate::{RequestResult, SharedState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAccessParams {
    pub name: String,
    #[serde(rename = "type", default = "default_access_type")]
    pub access_type: AccessType,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub expires: Option<f64>,
}

fn default_access_type() -> AccessType {
    AccessType::Shared
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckAppParams {
    pub requesting_app_id: String,
    #[serde(default)]
    pub requested_permissions: Vec<Permission>,
}

pub async fn list(
    State(state): State<SharedState>,
    Path(username): Path<String>,
    headers: HeaderMap,
    Query(query): Query<AuthQuery>,
) -> RequestResult<impl IntoResponse> {
    let auth = parse_auth(&headers, query.auth());
    let ctx = MethodContext::acquire(&state, &username, auth, "accesses.get").await?;

    let all = state.accounts.list_accesses(&ctx.user_id, false).await?;
    let own_id = ctx.access.access().id.clone();
    let accesses: Vec<Access> = match ctx.access.access().access_type {
        AccessType::Personal => all,
        _ => all
            .into_iter()
            .filter(|a| a.id == own_id || a.created_by == own_id.as_str())
            .collect(),
    };
    Ok(AppJson(serde_json::json!({ "accesses": accesses })))
}

pub async fn create(
    State(state): State<SharedState>,
    Path(username): Path<String>,
    headers: HeaderMap,
    Query(query): Query<AuthQuery>,
    AppJson(params): AppJson<NewAccessParams>,
) -> RequestResult<impl IntoResponse> {
    let auth = parse_auth(&headers, query.auth());
    let ctx = MethodContext::acquire(&state, &username, auth, "accesses.create").await?;
    let now = Timestamp::now();

    for permission in &params.permissions {
        permission
            .check_well_formed()
            .map_err(ApiError::invalid_parameters)?;
    }
    ctx.access
        .can_create_access(params.access_type, &params.permissions)
        .map_err(|denial| ApiError::forbidden(denial.to_string()))?;

    if params.access_type != AccessType::App && params.device_name.is_some() {
        return Err(
            ApiError::invalid_parameters("Only app accesses carry a device name").into(),
        );
    }

    let token = match params.token {
        Some(token) => {
            if token.is_empty() || token.contains(char::is_whitespace) || token.starts_with('.') {
                return Err(ApiError::InvalidItemId {
                    message: format!("Invalid token `{token}`"),
                }
                .into());
            }
            token
        }
        None => tessera_core::id::generate_token(),
    };

    let access = Access {
        id: AccessId::generate(),
        token: Some(token),
        access_type: params.access_type,
        name: params.name,
        device_name: params.device_name,
        permissions: params.permissions,
        calls: BTreeMap::new(),
        created: now,
        created_by: ctx.author(),
        modified: now,
        modified_by: ctx.author(),
        expires: params.expires.map(Timestamp::from_secs),
        deleted: None,
        integrity: None,
    };

    if state
        .accounts
        .access_identity_taken(&ctx.user_id, &access)
        .await?
    {
        return Err(ApiError::ItemAlreadyExists {
            data: serde_json::json!({
                "name": access.name,
                "type": access.access_type,
                "deviceName": access.device_name,
            }),
        }
        .into());
    }

    state.accounts.store_access(&ctx.user_id, &access).await?;
    Ok((
        StatusCode::CREATED,
        AppJson(serde_json::json!({ "access": access })),
    ))
}

pub async fn delete(
    State(state): State<SharedState>,
    Path((username, access_id)): Path<(String, String)>,
    headers: HeaderMap,
    Query(query): Query<AuthQuery>,
) -> RequestResult<impl IntoResponse> {
    let auth = parse_auth(&headers, query.auth());
    let ctx = MethodContext::acquire(&state, &username, auth, "accesses.delete").await?;
    let now = Timestamp::now();

    let access_id: AccessId = access_id.parse().map_err(|_| ApiError::InvalidItemId {
        message: format!("Malformed access id `{access_id}`"),
    })?;
    let Some(target) = state.accounts.get_access_by_id(&ctx.user_id, &access_id).await? else {
        return Err(ApiError::UnknownResource {
            resource: "access",
            id: access_id.to_string(),
        }
        .into());
    };

    if !ctx.access.can_delete_access(&target) {
        return Err(ApiError::forbidden("This access cannot delete that access").into());
    }

    let deleted = state
        .accounts
        .mark_access_deleted(&ctx.user_id, &access_id, now)
        .await?
        .expect("looked up just above");
    if let Some(token) = &target.token {
        state.access_cache_evict(&format!("{}\n{token}", ctx.user_id));
    }

    Ok(AppJson(serde_json::json!({
        "accessDeletion": { "id": deleted.id, "deleted": deleted.deleted }
    })))
}

pub async fn check_app(
    State(state): State<SharedState>,
    Path(username): Path<String>,
    headers: HeaderMap,
    Query(query): Query<AuthQuery>,
    AppJson(params): AppJson<CheckAppParams>,
) -> RequestResult<impl IntoResponse> {
    let auth = parse_auth(&headers, query.auth());
    let ctx = MethodContext::acquire(&state, &username, auth, "accesses.checkApp").await?;

    let live = state.accounts.list_accesses(&ctx.user_id, false).await?;
    let candidate = live.into_iter().find(|a| {
        a.access_type == AccessType::App && a.name == params.requesting_app_id
    });

    let body = match candidate {
        Some(existing) if existing.permissions == params.requested_permissions => {
            serde_json::json!({ "matchingAccess": existing })
        }
        Some(existing) => serde_json::json!({
            "mismatchingAccess": existing,
            "checkedPermissions": params.requested_permissions,
        }),
        None => serde_json::json!({ "checkedPermissions": params.requested_permissions }),
    };
    Ok(AppJson(body))
}
