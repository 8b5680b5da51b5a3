//! Node configuration.
//!
//! Loading and merging config files is the operator shell's job; this module
//! only defines the typed shape the core consumes.

use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    /// Standalone ("DNS-less") deployment: the service-register is never
    /// consulted and uniqueness is enforced locally only.
    #[serde(default)]
    pub dns_less: bool,

    /// Required unless `dns_less`; the process refuses to start without it
    /// in cluster mode.
    #[serde(default)]
    pub service_register: Option<ServiceRegisterConfig>,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    /// Operator-declared custom system streams.
    #[serde(default)]
    pub custom_streams: CustomStreamsConfig,

    /// Accept the un-prefixed duplicate-id check skip for deployments that
    /// predate prefixed system stream ids.
    #[serde(default)]
    pub backward_compatibility_prefix: bool,

    #[serde(default)]
    pub previews: PreviewsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ServiceRegisterConfig {
    pub url: String,
    pub key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct HttpConfig {
    pub listen: String,
    /// Base used to compose `apiEndpoint` values returned by login.
    pub public_url: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:3000".to_owned(),
            public_url: "http://127.0.0.1:3000".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Tombstones older than this are physically purged.
    pub events_deletions_retention_secs: f64,
    /// Upper bound of concurrently open per-user databases.
    pub user_db_pool_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            events_deletions_retention_secs: 365.0 * 24.0 * 3600.0,
            user_db_pool_size: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct AuthConfig {
    /// Personal sessions expire after this much inactivity.
    pub session_max_age_secs: f64,
    /// "No reuse of last N" password rotation policy depth.
    pub password_history_depth: usize,
    /// When set, registration requires one of these invitation tokens.
    pub invitation_tokens: Option<Vec<String>>,
    /// Grants every non-forbidden access read on its own audit stream.
    pub self_audit: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_max_age_secs: 1_209_600.0,
            password_history_depth: 5,
            invitation_tokens: None,
            self_audit: true,
        }
    }
}

/// One operator-declared system stream. Children may nest.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StreamSeed {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub is_indexed: Option<bool>,
    #[serde(default)]
    pub is_unique: Option<bool>,
    #[serde(default)]
    pub is_shown: Option<bool>,
    #[serde(default)]
    pub is_editable: Option<bool>,
    #[serde(default)]
    pub is_required_in_validation: Option<bool>,
    #[serde(default)]
    pub regex_validation: Option<String>,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub children: Vec<StreamSeed>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CustomStreamsConfig {
    /// Placed under the reserved `account` root; inherit account semantics.
    #[serde(default)]
    pub account: Vec<StreamSeed>,
    /// Placed under `other`; must be plain editable visible streams.
    #[serde(default)]
    pub other: Vec<StreamSeed>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct PreviewsConfig {
    pub cache_dir: PathBuf,
    /// Previews not accessed for this long are swept.
    pub max_age_secs: f64,
}

impl Default for PreviewsConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./data/previews"),
            max_age_secs: 30.0 * 24.0 * 3600.0,
        }
    }
}
