//! HTTP client for the external service-register.

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable as _};
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::{
    CreateUser, LOG_TARGET, RegisterError, RegisterResult, ServiceRegister, UserUpdate,
    ValidateUser,
};

/// 5xx responses are retried this many times before giving up; 4xx are
/// final and surfaced as-is.
const RETRY_BUDGET: usize = 3;

pub struct HttpRegister {
    base_url: Url,
    key: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct CheckUsernameBody {
    reserved: bool,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<ErrorDetails>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetails {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

impl ErrorBody {
    fn id(&self) -> Option<&str> {
        self.error
            .as_ref()
            .and_then(|e| e.id.as_deref())
            .or(self.id.as_deref())
    }

    fn data(self) -> Option<serde_json::Value> {
        match self.error {
            Some(details) => details.data,
            None => self.data,
        }
    }
}

impl HttpRegister {
    pub fn new(base_url: Url, key: impl Into<String>) -> HttpRegister {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client");
        HttpRegister {
            base_url,
            key: key.into(),
            client,
        }
    }

    fn endpoint(&self, path: &str) -> RegisterResult<Url> {
        self.base_url
            .join(path)
            .map_err(|err| RegisterError::Unavailable {
                message: format!("bad register url: {err}"),
            })
    }

    /// Issue one request, retrying server-side failures.
    async fn send(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder + Send + Sync,
    ) -> RegisterResult<reqwest::Response> {
        let attempt = || async {
            let response = build()
                .header("Authorization", &self.key)
                .send()
                .await
                .map_err(|err| RegisterError::Unavailable {
                    message: err.to_string(),
                })?;
            let status = response.status();
            if status.is_server_error() {
                return Err(RegisterError::Unavailable {
                    message: format!("register replied {status}"),
                });
            }
            Ok(response)
        };

        attempt
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(Duration::from_millis(100))
                    .with_max_times(RETRY_BUDGET),
            )
            .when(|err| matches!(err, RegisterError::Unavailable { .. }))
            .notify(|err, delay| {
                warn!(target: LOG_TARGET, %err, ?delay, "Retrying register call");
            })
            .await
    }

    /// Map non-success responses to the error taxonomy.
    async fn check(response: reqwest::Response) -> RegisterResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let code = status.as_u16();
        let body: ErrorBody = response.json().await.unwrap_or(ErrorBody {
            error: None,
            id: None,
            data: None,
        });

        if code == 409 {
            let data = body.data().unwrap_or(serde_json::Value::Null);
            return Err(RegisterError::ItemAlreadyExists { data });
        }
        if body.id() == Some("invalid-invitation-token")
            || body.id() == Some("invalidInvitationToken")
        {
            return Err(RegisterError::InvalidInvitationToken);
        }
        Err(RegisterError::Rejected {
            status: code,
            message: body.id().unwrap_or("unspecified").to_owned(),
        })
    }
}

#[async_trait::async_trait]
impl ServiceRegister for HttpRegister {
    async fn validate_user(&self, request: &ValidateUser) -> RegisterResult<()> {
        let url = self.endpoint("users/validate")?;
        debug!(target: LOG_TARGET, username = %request.username, "Validating user on register");
        let response = self
            .send(|| self.client.post(url.clone()).json(request))
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn check_username(&self, username: &str) -> RegisterResult<bool> {
        let url = self.endpoint(&format!("{username}/check_username"))?;
        let response = self.send(|| self.client.get(url.clone())).await?;
        let response = Self::check(response).await?;
        let body: CheckUsernameBody =
            response
                .json()
                .await
                .map_err(|err| RegisterError::Unavailable {
                    message: format!("malformed check_username reply: {err}"),
                })?;
        Ok(body.reserved)
    }

    async fn create_user(&self, payload: &CreateUser) -> RegisterResult<()> {
        let url = self.endpoint("users")?;
        debug!(target: LOG_TARGET, username = %payload.username, "Creating user on register");
        let response = self
            .send(|| self.client.post(url.clone()).json(payload))
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn update_user(&self, update: &UserUpdate) -> RegisterResult<()> {
        let url = self.endpoint("users")?;
        let response = self
            .send(|| self.client.put(url.clone()).json(update))
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn delete_user(&self, username: &str, only_reg: bool) -> RegisterResult<()> {
        let mut url = self.endpoint(&format!("users/{username}"))?;
        if only_reg {
            url.query_pairs_mut().append_pair("onlyReg", "true");
        }
        debug!(target: LOG_TARGET, %username, only_reg, "Deleting user on register");
        let response = self.send(|| self.client.delete(url.clone())).await?;
        Self::check(response).await?;
        Ok(())
    }
}
