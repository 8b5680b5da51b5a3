//! The service-register port.
//!
//! In cluster mode the external service-register is the authoritative owner
//! of cross-node uniqueness for indexed account fields; this crate talks to
//! it over HTTP. In standalone mode a local implementation enforces
//! uniqueness against the node's own index and the register is never
//! consulted. Everything upstream programs against the [`ServiceRegister`]
//! trait, so tests substitute an in-memory fake instead of patching HTTP.

mod http;
mod local;
mod sanitize;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::Snafu;

pub use self::http::HttpRegister;
pub use self::local::LocalRegister;
pub use self::sanitize::sanitize_conflicts;

const LOG_TARGET: &str = "tessera::register";

/// One indexed-field value in the register wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldEntry {
    pub value: serde_json::Value,
    pub is_unique: bool,
    pub is_active: bool,
    /// True on the initial PUT after user creation.
    pub creation: bool,
}

/// `PUT /users` payload: per-field entries plus explicit deletions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserUpdate {
    pub username: String,
    pub user: BTreeMap<String, Vec<FieldEntry>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields_to_delete: BTreeMap<String, serde_json::Value>,
}

/// Pre-registration validation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateUser {
    pub username: String,
    pub invitation_token: String,
    pub unique_fields: BTreeMap<String, serde_json::Value>,
    /// This node's public endpoint, so the register can route the username.
    pub core: String,
}

/// Registration payload forwarded after local creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUser {
    pub username: String,
    pub invitation_token: String,
    pub fields: BTreeMap<String, serde_json::Value>,
    pub core: String,
}

#[derive(Debug, Snafu)]
pub enum RegisterError {
    /// Uniqueness collision; `data` is the raw field→value map as reported
    /// by the register — callers must sanitize it before surfacing.
    #[snafu(display("Fields already in use"))]
    ItemAlreadyExists { data: serde_json::Value },

    #[snafu(display("Invalid invitation token"))]
    InvalidInvitationToken,

    #[snafu(display("Register rejected the request ({status}): {message}"))]
    Rejected { status: u16, message: String },

    #[snafu(display("Register unreachable or failing: {message}"))]
    Unavailable { message: String },
}

pub type RegisterResult<T> = std::result::Result<T, RegisterError>;

#[async_trait]
pub trait ServiceRegister: Send + Sync {
    /// Pre-check username, invitation token and unique fields.
    async fn validate_user(&self, request: &ValidateUser) -> RegisterResult<()>;

    /// Whether a username is reserved (taken or reserved word).
    async fn check_username(&self, username: &str) -> RegisterResult<bool>;

    async fn create_user(&self, payload: &CreateUser) -> RegisterResult<()>;

    async fn update_user(&self, update: &UserUpdate) -> RegisterResult<()>;

    /// `only_reg` removes the register-side shadow without touching other
    /// cluster state; used by the pre-clean step and user deletion.
    async fn delete_user(&self, username: &str, only_reg: bool) -> RegisterResult<()>;
}
