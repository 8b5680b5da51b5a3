use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use snafu::Snafu;
use tessera_accounts::AccountsError;
use tessera_core::ApiError;
use tessera_core::error::ErrorEnvelope;
use tessera_user_db::DbError;
use tracing::{info, warn};

use crate::LOG_TARGET;
use crate::routes::AppJson;

/// Everything a request handler can fail with. Storage errors fold into the
/// API taxonomy at the response boundary.
#[derive(Debug, Snafu)]
pub enum RequestError {
    #[snafu(transparent)]
    Api { source: ApiError },

    #[snafu(transparent)]
    Db { source: DbError },

    #[snafu(transparent)]
    Accounts { source: AccountsError },

    #[snafu(transparent)]
    JsonBody { source: JsonRejection },
}

pub type RequestResult<T> = std::result::Result<T, RequestError>;

impl RequestError {
    pub fn into_api(self) -> ApiError {
        match self {
            RequestError::Api { source } => source,
            RequestError::Db {
                source: DbError::EventNotFound { event_id },
            } => ApiError::UnknownResource {
                resource: "event",
                id: event_id,
            },
            RequestError::Db { source } => ApiError::unexpected(Box::new(source)),
            RequestError::Accounts {
                source: AccountsError::UsernameTaken { username },
            } => ApiError::ItemAlreadyExists {
                data: serde_json::json!({ "username": username }),
            },
            RequestError::Accounts { source } => ApiError::unexpected(Box::new(source)),
            RequestError::JsonBody { source } => ApiError::invalid_parameters(source.to_string()),
        }
    }
}

impl IntoResponse for RequestError {
    fn into_response(self) -> Response {
        let api = self.into_api();
        if api.http_status() >= 500 {
            warn!(target: LOG_TARGET, id = api.id(), "Request failed: {api}");
        } else {
            info!(target: LOG_TARGET, id = api.id(), "Request rejected: {api}");
        }
        let status =
            StatusCode::from_u16(api.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, AppJson(ErrorEnvelope::from(&api))).into_response()
    }
}
