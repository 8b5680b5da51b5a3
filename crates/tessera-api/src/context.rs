//! Per-request method context: auth parsing, user and access loading,
//! session touch, tracking properties.

use std::sync::Arc;

use axum::http::HeaderMap;
use tessera_access::AccessLogic;
use tessera_core::id::UserId;
use tessera_core::{ApiError, Timestamp};
use tracing::{debug, warn};

use crate::{AppState, LOG_TARGET};

/// Parsed `Authorization` material: `<token>` or `<token> <callerId>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthInfo {
    pub token: String,
    pub caller_id: Option<String>,
}

/// What the operator's custom auth step gets to see.
pub struct AuthContext<'a> {
    pub username: &'a str,
    pub token: &'a str,
    pub caller_id: Option<&'a str>,
    pub access: &'a AccessLogic,
}

/// Accepts the `Authorization` header (`<token>`, `<token> <callerId>` or
/// `Basic base64(token:)`) with a `?auth=` query fallback.
pub fn parse_auth(headers: &HeaderMap, query_auth: Option<&str>) -> Option<AuthInfo> {
    let raw = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
        .or_else(|| query_auth.map(str::to_owned))?;

    if let Some(encoded) = raw.strip_prefix("Basic ") {
        let decoded = data_encoding::BASE64.decode(encoded.trim().as_bytes()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let token = decoded.split(':').next()?.trim();
        if token.is_empty() {
            return None;
        }
        return Some(AuthInfo {
            token: token.to_owned(),
            caller_id: None,
        });
    }

    match raw.split_once(' ') {
        Some((token, caller_id)) if !caller_id.trim().is_empty() => Some(AuthInfo {
            token: token.to_owned(),
            caller_id: Some(caller_id.trim().to_owned()),
        }),
        _ => Some(AuthInfo {
            token: raw,
            caller_id: None,
        }),
    }
}

/// The envelope of one API call: resolved user, loaded access policy and
/// caller attribution.
pub struct MethodContext {
    pub username: String,
    pub user_id: UserId,
    pub access: Arc<AccessLogic>,
    pub caller_id: Option<String>,
}

impl MethodContext {
    /// Resolve the user, verify the token and build (or fetch) the access
    /// policy, enforcing expiry, session liveness and the per-method type
    /// gate.
    pub async fn acquire(
        state: &AppState,
        username: &str,
        auth: Option<AuthInfo>,
        method_id: &str,
    ) -> Result<MethodContext, ApiError> {
        let user_id = state
            .accounts
            .get_user_id(username)
            .await
            .map_err(|err| ApiError::unexpected(Box::new(err)))?
            .ok_or(ApiError::UnknownResource {
                resource: "user",
                id: username.to_owned(),
            })?;

        let Some(auth) = auth else {
            return Err(ApiError::invalid_access_token(
                "Missing access token (Authorization header or `auth` parameter)",
            ));
        };

        let now = Timestamp::now();
        let cache_key = format!("{user_id}\n{}", auth.token);

        let access = match state.access_cache_get(&cache_key) {
            Some(cached) => cached,
            None => {
                let Some(record) = state
                    .accounts
                    .get_access_by_token(&user_id, &auth.token)
                    .await
                    .map_err(|err| ApiError::unexpected(Box::new(err)))?
                else {
                    return Err(ApiError::invalid_access_token("Unknown access token"));
                };
                if record.deleted.is_some() {
                    return Err(ApiError::invalid_access_token("Access was revoked"));
                }
                let logic = Arc::new(state.access_builder.build(record));
                state.access_cache_put(cache_key.clone(), logic.clone());
                logic
            }
        };

        if access.access().is_expired(now) {
            state.access_cache_evict(&cache_key);
            return Err(ApiError::invalid_access_token("Access has expired"));
        }

        if access.is_personal() {
            // the personal token is its session token
            let session = state
                .accounts
                .get_session(&auth.token, now, state.config.auth.session_max_age_secs)
                .await
                .map_err(|err| ApiError::unexpected(Box::new(err)))?;
            match session {
                Some(session) if session.username == username => {
                    // async touch; errors only degrade expiry accuracy
                    let accounts = state.accounts.clone();
                    let token = auth.token.clone();
                    tokio::spawn(async move {
                        if let Err(err) = accounts.touch_session(&token, now).await {
                            warn!(target: LOG_TARGET, %err, "Session touch failed");
                        }
                    });
                }
                _ => {
                    state.access_cache_evict(&cache_key);
                    return Err(ApiError::invalid_access_token("Session has ended"));
                }
            }
        }

        if let Some(step) = &state.custom_auth {
            let check = AuthContext {
                username,
                token: &auth.token,
                caller_id: auth.caller_id.as_deref(),
                access: &access,
            };
            if let Err(reason) = step(&check) {
                debug!(target: LOG_TARGET, %reason, "Custom auth step rejected the call");
                return Err(ApiError::invalid_access_token(reason));
            }
        }

        if !access.can_call(method_id) {
            return Err(ApiError::forbidden(format!(
                "This access cannot call `{method_id}`"
            )));
        }

        Ok(MethodContext {
            username: username.to_owned(),
            user_id,
            access,
            caller_id: auth.caller_id,
        })
    }

    /// `accessId` optionally composed with the caller id by a single space.
    pub fn author(&self) -> String {
        match &self.caller_id {
            Some(caller_id) => format!("{} {caller_id}", self.access.access().id),
            None => self.access.access().id.to_string(),
        }
    }

    pub fn init_tracking(&self, event: &mut tessera_core::event::Event, now: Timestamp) {
        let author = self.author();
        event.created = now;
        event.created_by = author.clone();
        event.modified = now;
        event.modified_by = author;
    }

    pub fn update_tracking(&self, event: &mut tessera_core::event::Event, now: Timestamp) {
        event.modified = now;
        event.modified_by = self.author();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            value.parse().expect("header value"),
        );
        headers
    }

    #[test]
    fn plain_token() {
        let auth = parse_auth(&headers_with("ctoken123"), None).unwrap();
        assert_eq!(auth.token, "ctoken123");
        assert_eq!(auth.caller_id, None);
    }

    #[test]
    fn token_with_caller_id() {
        let auth = parse_auth(&headers_with("ctoken123 worker-7"), None).unwrap();
        assert_eq!(auth.token, "ctoken123");
        assert_eq!(auth.caller_id.as_deref(), Some("worker-7"));
    }

    #[test]
    fn basic_scheme() {
        // base64("ctoken123:")
        let encoded = data_encoding::BASE64.encode(b"ctoken123:");
        let auth = parse_auth(&headers_with(&format!("Basic {encoded}")), None).unwrap();
        assert_eq!(auth.token, "ctoken123");
        assert_eq!(auth.caller_id, None);
    }

    #[test]
    fn query_fallback() {
        let auth = parse_auth(&HeaderMap::new(), Some("ctoken123")).unwrap();
        assert_eq!(auth.token, "ctoken123");
        assert!(parse_auth(&HeaderMap::new(), None).is_none());
    }
}
