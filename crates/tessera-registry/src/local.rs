//! Standalone-mode register: uniqueness against the local index only.

use std::sync::Arc;

use tessera_accounts::AccountsDb;
use tracing::debug;

use crate::{
    CreateUser, LOG_TARGET, RegisterError, RegisterResult, ServiceRegister, UserUpdate,
    ValidateUser,
};

/// Usernames no one may register, mirroring what the cluster register
/// refuses.
const RESERVED_USERNAMES: &[&str] = &["admin", "register", "root", "system", "www"];

pub struct LocalRegister {
    accounts: Arc<AccountsDb>,
    /// When set, registration requires one of these invitation tokens.
    invitation_tokens: Option<Vec<String>>,
}

impl LocalRegister {
    pub fn new(accounts: Arc<AccountsDb>, invitation_tokens: Option<Vec<String>>) -> Self {
        Self {
            accounts,
            invitation_tokens,
        }
    }

    fn as_text(value: &serde_json::Value) -> String {
        match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    fn storage_error(err: tessera_accounts::AccountsError) -> RegisterError {
        RegisterError::Unavailable {
            message: err.to_string(),
        }
    }

    async fn collect_conflicts(
        &self,
        username: &str,
        unique_fields: &std::collections::BTreeMap<String, serde_json::Value>,
    ) -> RegisterResult<serde_json::Map<String, serde_json::Value>> {
        let mut conflicts = serde_json::Map::new();

        let owner_id = self
            .accounts
            .get_user_id(username)
            .await
            .map_err(Self::storage_error)?;

        for (field, value) in unique_fields {
            let owner = self
                .accounts
                .lookup_unique(field, &Self::as_text(value))
                .await
                .map_err(Self::storage_error)?;
            let taken_by_other = match (&owner, &owner_id) {
                (Some(holder), Some(me)) => holder != me,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if taken_by_other {
                conflicts.insert(field.clone(), value.clone());
            }
        }
        Ok(conflicts)
    }
}

#[async_trait::async_trait]
impl ServiceRegister for LocalRegister {
    async fn validate_user(&self, request: &ValidateUser) -> RegisterResult<()> {
        if let Some(tokens) = &self.invitation_tokens {
            if !tokens.iter().any(|t| t == &request.invitation_token) {
                return Err(RegisterError::InvalidInvitationToken);
            }
        }

        let mut conflicts = self.collect_conflicts(&request.username, &request.unique_fields).await?;
        if self.check_username(&request.username).await? {
            conflicts.insert(
                "username".to_owned(),
                serde_json::Value::String(request.username.clone()),
            );
        }
        if !conflicts.is_empty() {
            return Err(RegisterError::ItemAlreadyExists {
                data: serde_json::Value::Object(conflicts),
            });
        }
        Ok(())
    }

    async fn check_username(&self, username: &str) -> RegisterResult<bool> {
        if RESERVED_USERNAMES.contains(&username) {
            return Ok(true);
        }
        let taken = self
            .accounts
            .get_user_id(username)
            .await
            .map_err(Self::storage_error)?
            .is_some();
        Ok(taken)
    }

    async fn create_user(&self, payload: &CreateUser) -> RegisterResult<()> {
        debug!(target: LOG_TARGET, username = %payload.username, "Standalone register create");
        Ok(())
    }

    async fn update_user(&self, update: &UserUpdate) -> RegisterResult<()> {
        let Some(user_id) = self
            .accounts
            .get_user_id(&update.username)
            .await
            .map_err(Self::storage_error)?
        else {
            return Err(RegisterError::Rejected {
                status: 404,
                message: "unknown user".to_owned(),
            });
        };

        // claim unique+active values; report collisions like the cluster
        // register would
        let mut conflicts = serde_json::Map::new();
        for (field, entries) in &update.user {
            for entry in entries {
                if !(entry.is_unique && entry.is_active) {
                    continue;
                }
                let value = Self::as_text(&entry.value);
                let claim = self
                    .accounts
                    .claim_unique(field, &value, &user_id)
                    .await
                    .map_err(Self::storage_error)?;
                if claim.is_err() {
                    conflicts.insert(field.clone(), entry.value.clone());
                }
            }
        }
        if !conflicts.is_empty() {
            return Err(RegisterError::ItemAlreadyExists {
                data: serde_json::Value::Object(conflicts),
            });
        }

        for (field, value) in &update.fields_to_delete {
            self.accounts
                .release_unique(field, &Self::as_text(value))
                .await
                .map_err(Self::storage_error)?;
        }
        Ok(())
    }

    async fn delete_user(&self, username: &str, _only_reg: bool) -> RegisterResult<()> {
        if let Some(user_id) = self
            .accounts
            .get_user_id(username)
            .await
            .map_err(Self::storage_error)?
        {
            self.accounts
                .release_unique_for(&user_id)
                .await
                .map_err(Self::storage_error)?;
        }
        Ok(())
    }
}
