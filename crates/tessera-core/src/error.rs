//! The canonical API error taxonomy.
//!
//! Every failure that crosses a component boundary is one of these kinds;
//! the HTTP layer maps kinds to statuses and serializes the
//! `{error: {id, message, data?}}` envelope. Storage-internal errors (busy
//! retries, row codecs) stay inside their crates and surface here only as
//! [`ApiError::Unexpected`].

use serde::Serialize;
use snafu::Snafu;

use crate::fmt::BoxedError;

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Snafu)]
pub enum ApiError {
    #[snafu(display("{message}"))]
    InvalidAccessToken { message: String },

    #[snafu(display("{message}"))]
    Forbidden { message: String },

    #[snafu(display("Unknown {resource} `{id}`"))]
    UnknownResource { resource: &'static str, id: String },

    #[snafu(display("Item already exists: {}", data_summary(data)))]
    ItemAlreadyExists { data: serde_json::Value },

    #[snafu(display("{message}"))]
    InvalidOperation {
        message: String,
        data: Option<serde_json::Value>,
    },

    #[snafu(display("{message}"))]
    InvalidItemId { message: String },

    #[snafu(display("{message}"))]
    InvalidParametersFormat { message: String },

    #[snafu(display("Invalid invitation token"))]
    InvalidInvitationToken,

    #[snafu(display("{message}"))]
    CorruptedData { message: String },

    #[snafu(display("Unexpected error: {source}"))]
    Unexpected { source: BoxedError },
}

fn data_summary(data: &serde_json::Value) -> String {
    data.as_object()
        .map(|fields| {
            let mut keys: Vec<&str> = fields.keys().map(String::as_str).collect();
            keys.sort_unstable();
            keys.join(", ")
        })
        .unwrap_or_default()
}

impl ApiError {
    pub fn unexpected(source: impl Into<BoxedError>) -> Self {
        ApiError::Unexpected {
            source: source.into(),
        }
    }

    pub fn invalid_access_token(message: impl Into<String>) -> Self {
        ApiError::InvalidAccessToken {
            message: message.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        ApiError::Forbidden {
            message: message.into(),
        }
    }

    pub fn invalid_operation(message: impl Into<String>) -> Self {
        ApiError::InvalidOperation {
            message: message.into(),
            data: None,
        }
    }

    pub fn invalid_parameters(message: impl Into<String>) -> Self {
        ApiError::InvalidParametersFormat {
            message: message.into(),
        }
    }

    /// Canonical string identifier, stable across versions.
    pub fn id(&self) -> &'static str {
        match self {
            ApiError::InvalidAccessToken { .. } => "invalid-access-token",
            ApiError::Forbidden { .. } => "forbidden",
            ApiError::UnknownResource { .. } => "unknown-resource",
            ApiError::ItemAlreadyExists { .. } => "item-already-exists",
            ApiError::InvalidOperation { .. } => "invalid-operation",
            ApiError::InvalidItemId { .. } => "invalid-item-id",
            ApiError::InvalidParametersFormat { .. } => "invalid-parameters-format",
            ApiError::InvalidInvitationToken => "invalid-invitation-token",
            ApiError::CorruptedData { .. } => "corrupted-data",
            ApiError::Unexpected { .. } => "unexpected-error",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            ApiError::InvalidAccessToken { .. } => 401,
            ApiError::Forbidden { .. } => 403,
            ApiError::UnknownResource { .. } => 404,
            ApiError::ItemAlreadyExists { .. } => 409,
            ApiError::InvalidOperation { .. }
            | ApiError::InvalidItemId { .. }
            | ApiError::InvalidParametersFormat { .. }
            | ApiError::InvalidInvitationToken => 400,
            ApiError::CorruptedData { .. } | ApiError::Unexpected { .. } => 500,
        }
    }

    /// Extra payload for the error envelope, when the kind carries one.
    pub fn data(&self) -> Option<&serde_json::Value> {
        match self {
            ApiError::ItemAlreadyExists { data } => Some(data),
            ApiError::InvalidOperation { data, .. } => data.as_ref(),
            _ => None,
        }
    }
}

/// Wire shape of an error response body.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub id: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl From<&ApiError> for ErrorEnvelope {
    fn from(err: &ApiError) -> Self {
        ErrorEnvelope {
            error: ErrorBody {
                id: err.id(),
                message: err.to_string(),
                data: err.data().cloned(),
            },
        }
    }
}
