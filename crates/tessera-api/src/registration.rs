//! The registration pipeline.
//!
//! Registration spans two systems (the local store and the
//! service-register) and must stay consistent under partial failure. It
//! runs as a fixed sequence of stages; every successful stage pushes a
//! compensation, and the first failure unwinds the accumulated
//! compensations in reverse order before surfacing the error.

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tessera_core::access::{Access, AccessType};
use tessera_core::id::{AccessId, UserId};
use tessera_core::{ApiError, Timestamp};
use tessera_registry::{CreateUser, FieldEntry, UserUpdate, ValidateUser};
use tracing::{info, warn};

use crate::account_events::register_error_to_api;
use crate::{AppState, LOG_TARGET, RequestResult};

/// Author stamped on records created by the pipeline itself.
const PIPELINE_AUTHOR: &str = "system";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationParams {
    pub username: String,
    pub password: String,
    pub app_id: String,
    #[serde(default)]
    pub invitation_token: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub referer: Option<String>,
    /// Values for operator-declared account streams (`email`, …), keyed by
    /// bare stream name.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationOutcome {
    pub username: String,
    pub api_endpoint: String,
}

/// Undo actions, pushed per successful stage, run newest-first on failure.
enum Compensation {
    RemoveIndexRow { user_id: UserId },
    DeleteUserDb { user_id: UserId },
    DeletePasswords { user_id: UserId },
    DeleteSessions { username: String },
    DeleteAccesses { user_id: UserId },
    RegisterDelete { username: String },
}

struct Prepared {
    /// Bare stream name → value for every account attribute to materialize.
    values: BTreeMap<String, serde_json::Value>,
    unique_fields: BTreeMap<String, serde_json::Value>,
    indexed_fields: BTreeMap<String, serde_json::Value>,
    invitation_token: String,
    app_id: String,
    password: String,
}

impl AppState {
    pub async fn register_user(
        &self,
        params: RegistrationParams,
    ) -> RequestResult<RegistrationOutcome> {
        let username = params.username.clone();
        let prepared = self.validate_and_prepare(params)?;

        // register-side validation (standalone mode validates locally)
        let validate = ValidateUser {
            username: username.clone(),
            invitation_token: prepared.invitation_token.clone(),
            unique_fields: prepared.unique_fields.clone(),
            core: self.config.http.public_url.clone(),
        };
        if let Err(err) = self.register.validate_user(&validate).await {
            return Err(register_error_to_api(err, &prepared.unique_fields, &username).into());
        }

        // pre-clean: a locally present user that passed register-side
        // validation is an orphan of a half-finished registration
        if let Some(orphan_id) = self.accounts.get_user_id(&username).await? {
            info!(target: LOG_TARGET, %username, "Pre-cleaning orphaned local user");
            self.delete_user_local(&orphan_id, &username).await?;
            if let Err(err) = self.register.delete_user(&username, true).await {
                warn!(target: LOG_TARGET, %err, "Pre-clean register delete failed; continuing");
            }
        }

        match self.create_everywhere(&username, &prepared).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => Err(err),
        }
    }

    async fn create_everywhere(
        &self,
        username: &str,
        prepared: &Prepared,
    ) -> RequestResult<RegistrationOutcome> {
        let mut compensations: Vec<Compensation> = Vec::new();
        let now = Timestamp::now();

        macro_rules! stage {
            ($expr:expr) => {
                match $expr {
                    Ok(value) => value,
                    Err(err) => {
                        self.run_compensations(compensations).await;
                        return Err(err.into());
                    }
                }
            };
        }

        // local user: index row, account events, password, session,
        // personal access
        let user_id = UserId::generate();
        stage!(self.accounts.add_user(username, &user_id).await);
        compensations.push(Compensation::RemoveIndexRow {
            user_id: user_id.clone(),
        });

        stage!(
            self.create_account_events(&user_id, &prepared.values, PIPELINE_AUTHOR, now)
                .await
        );
        compensations.push(Compensation::DeleteUserDb {
            user_id: user_id.clone(),
        });

        let hash = stage!(tessera_accounts::hash_password(&prepared.password));
        stage!(
            self.accounts
                .set_password_hash(
                    &user_id,
                    hash,
                    PIPELINE_AUTHOR,
                    self.config.auth.password_history_depth,
                )
                .await
        );
        compensations.push(Compensation::DeletePasswords {
            user_id: user_id.clone(),
        });

        let session_token = stage!(self.accounts.create_session(username, &prepared.app_id).await);
        compensations.push(Compensation::DeleteSessions {
            username: username.to_owned(),
        });

        let personal = Access {
            id: AccessId::generate(),
            token: Some(session_token),
            access_type: AccessType::Personal,
            name: prepared.app_id.clone(),
            device_name: None,
            permissions: vec![],
            calls: BTreeMap::new(),
            created: now,
            created_by: PIPELINE_AUTHOR.to_owned(),
            modified: now,
            modified_by: PIPELINE_AUTHOR.to_owned(),
            expires: None,
            deleted: None,
            integrity: None,
        };
        stage!(self.accounts.store_access(&user_id, &personal).await);
        compensations.push(Compensation::DeleteAccesses {
            user_id: user_id.clone(),
        });

        // register-side create
        let create = CreateUser {
            username: username.to_owned(),
            invitation_token: prepared.invitation_token.clone(),
            fields: prepared.indexed_fields.clone(),
            core: self.config.http.public_url.clone(),
        };
        if let Err(err) = self.register.create_user(&create).await {
            self.run_compensations(compensations).await;
            return Err(register_error_to_api(err, &prepared.unique_fields, username).into());
        }
        compensations.push(Compensation::RegisterDelete {
            username: username.to_owned(),
        });

        // register-side indexed-field PUT with creation flags
        let mut user = BTreeMap::new();
        for (field, value) in &prepared.indexed_fields {
            user.insert(
                field.clone(),
                vec![FieldEntry {
                    value: value.clone(),
                    is_unique: self.catalog.is_unique(field),
                    is_active: true,
                    creation: true,
                }],
            );
        }
        let update = UserUpdate {
            username: username.to_owned(),
            user,
            fields_to_delete: BTreeMap::new(),
        };
        if let Err(err) = self.register.update_user(&update).await {
            self.run_compensations(compensations).await;
            return Err(register_error_to_api(err, &prepared.indexed_fields, username).into());
        }

        // welcome mail: best effort, never surfaced
        let email = prepared
            .values
            .get("email")
            .and_then(|v| v.as_str())
            .map(str::to_owned);
        let language = prepared
            .values
            .get("language")
            .and_then(|v| v.as_str())
            .unwrap_or("en")
            .to_owned();
        if let Err(err) = self
            .mailer
            .send_welcome(username, email.as_deref(), &language)
            .await
        {
            warn!(target: LOG_TARGET, %err, "Welcome mail failed");
        }

        info!(target: LOG_TARGET, %username, %user_id, "Registered user");
        Ok(RegistrationOutcome {
            username: username.to_owned(),
            api_endpoint: self.api_endpoint_for(username),
        })
    }

    async fn run_compensations(&self, compensations: Vec<Compensation>) {
        for compensation in compensations.into_iter().rev() {
            let outcome = match compensation {
                Compensation::RemoveIndexRow { user_id } => self
                    .accounts
                    .delete_user_by_id(&user_id)
                    .await
                    .map(|_| ())
                    .map_err(|e| e.to_string()),
                Compensation::DeleteUserDb { user_id } => self
                    .user_dbs
                    .delete_user_db(&user_id)
                    .await
                    .map_err(|e| e.to_string()),
                Compensation::DeletePasswords { user_id } => self
                    .accounts
                    .delete_password_history(&user_id)
                    .await
                    .map_err(|e| e.to_string()),
                Compensation::DeleteSessions { username } => self
                    .accounts
                    .delete_sessions_for(&username)
                    .await
                    .map(|_| ())
                    .map_err(|e| e.to_string()),
                Compensation::DeleteAccesses { user_id } => self
                    .accounts
                    .delete_accesses_for(&user_id)
                    .await
                    .map(|_| ())
                    .map_err(|e| e.to_string()),
                Compensation::RegisterDelete { username } => self
                    .register
                    .delete_user(&username, true)
                    .await
                    .map_err(|e| e.to_string()),
            };
            if let Err(message) = outcome {
                warn!(target: LOG_TARGET, %message, "Registration compensation failed");
            }
        }
    }

    fn validate_and_prepare(&self, params: RegistrationParams) -> Result<Prepared, ApiError> {
        let username_stream = self
            .catalog
            .get_by_unprefixed("username")
            .expect("built-in stream");
        if let Some(pattern) = &username_stream.regex_validation {
            check_pattern("username", pattern, &params.username)?;
        }
        if params.password.len() < 4 || params.password.len() > 100 {
            return Err(ApiError::invalid_parameters(
                "Password must be between 4 and 100 characters",
            ));
        }
        if params.app_id.trim().is_empty() {
            return Err(ApiError::invalid_parameters("Missing appId"));
        }

        let mut values: BTreeMap<String, serde_json::Value> = BTreeMap::new();
        values.insert(
            "username".to_owned(),
            serde_json::Value::String(params.username.clone()),
        );
        values.insert(
            "language".to_owned(),
            serde_json::Value::String(params.language.clone().unwrap_or_else(|| "en".to_owned())),
        );
        values.insert(
            "appId".to_owned(),
            serde_json::Value::String(params.app_id.clone()),
        );
        let invitation_token = params
            .invitation_token
            .clone()
            .unwrap_or_else(|| "no-token".to_owned());
        values.insert(
            "invitationToken".to_owned(),
            serde_json::Value::String(invitation_token.clone()),
        );
        if let Some(referer) = &params.referer {
            values.insert(
                "referer".to_owned(),
                serde_json::Value::String(referer.clone()),
            );
        }

        for (field, value) in &params.extra {
            let Some(stream) = self.catalog.get_by_unprefixed(field) else {
                return Err(ApiError::invalid_parameters(format!(
                    "Unknown registration field `{field}`"
                )));
            };
            if let (Some(pattern), Some(text)) = (&stream.regex_validation, value.as_str()) {
                check_pattern(field, pattern, text)?;
            }
            values.insert(field.clone(), value.clone());
        }

        // required custom fields must be present
        for stream in self.catalog.account_attribute_leaves() {
            let bare = stream.unprefixed_id();
            if stream.is_required_in_validation
                && bare != "username"
                && bare != "passwordHash"
                && !values.contains_key(bare)
            {
                return Err(ApiError::invalid_parameters(format!(
                    "Missing required field `{bare}`"
                )));
            }
        }

        let unique_fields: BTreeMap<String, serde_json::Value> = self
            .catalog
            .unique_unprefixed()
            .iter()
            .filter(|name| name.as_str() != "username")
            .filter_map(|name| values.get(name).map(|v| (name.clone(), v.clone())))
            .collect();
        let indexed_fields: BTreeMap<String, serde_json::Value> = self
            .catalog
            .indexed_unprefixed()
            .iter()
            .filter_map(|name| values.get(name).map(|v| (name.clone(), v.clone())))
            .collect();

        Ok(Prepared {
            values,
            unique_fields,
            indexed_fields,
            invitation_token,
            app_id: params.app_id,
            password: params.password,
        })
    }
}

fn check_pattern(field: &str, pattern: &str, value: &str) -> Result<(), ApiError> {
    let compiled = Regex::new(pattern).map_err(|err| {
        ApiError::unexpected(Box::<dyn std::error::Error + Send + Sync>::from(format!(
            "invalid validation pattern for `{field}`: {err}"
        )))
    })?;
    if !compiled.is_match(value) {
        return Err(ApiError::invalid_parameters(format!(
            "Field `{field}` does not match the expected format"
        )));
    }
    Ok(())
}
