use crate::directory::config::DirectoryConfig;
use crate::directory::resources::error_for_status;
use crate::error::{ErrorCode, PublishError};
use crate::resilience::CircuitBreaker;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedToken {
    pub access_token: String,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
    pub refresh_token: Option<String>,
}

impl CachedToken {
    /// Usable only while `now < expires_at - buffer`.
    pub fn is_usable_at(&self, now: DateTime<Utc>, buffer: std::time::Duration) -> bool {
        let buffer = ChronoDuration::from_std(buffer).unwrap_or(ChronoDuration::zero());
        now < self.expires_at - buffer
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "TokenResponse::default_type")]
    token_type: String,
    #[serde(default = "TokenResponse::default_expiry")]
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
}

impl TokenResponse {
    fn default_type() -> String {
        "Bearer".to_string()
    }

    fn default_expiry() -> i64 {
        3600
    }
}

enum Grant {
    ClientCredentials,
    Refresh(String),
}

impl Grant {
    fn name(&self) -> &'static str {
        match self {
            Grant::ClientCredentials => "client_credentials",
            Grant::Refresh(_) => "refresh_token",
        }
    }
}

/// Process-wide bearer cache for the directory API.
///
/// Concurrent cold-start callers may each run an exchange; the last writer
/// wins. A failed exchange never touches the cache.
pub struct TokenProvider {
    config: Arc<DirectoryConfig>,
    http: Client,
    breaker: Arc<CircuitBreaker>,
    cache: RwLock<Option<CachedToken>>,
}

impl TokenProvider {
    pub fn new(config: Arc<DirectoryConfig>, http: Client, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            config,
            http,
            breaker,
            cache: RwLock::new(None),
        }
    }

    pub async fn get_token(&self) -> Result<CachedToken, PublishError> {
        let current = self.cached();
        if let Some(token) = current
            .as_ref()
            .filter(|t| t.is_usable_at(Utc::now(), self.config.token_safety_buffer))
        {
            return Ok(token.clone());
        }

        let (client_id, client_secret) = self.config.credentials().ok_or_else(|| {
            PublishError::config("DIRECTORY_CLIENT_ID and DIRECTORY_CLIENT_SECRET must be set")
        })?;

        let refresh_token = current.and_then(|t| t.refresh_token);
        let token = match refresh_token {
            Some(refresh) => {
                match self
                    .exchange(client_id, client_secret, Grant::Refresh(refresh))
                    .await
                {
                    Ok(token) => token,
                    Err(err) if err.code() == ErrorCode::OauthError => {
                        warn!(
                            target = "realty.directory",
                            error = %err,
                            "refresh_grant_rejected_falling_back"
                        );
                        self.exchange(client_id, client_secret, Grant::ClientCredentials)
                            .await?
                    }
                    Err(err) => return Err(err),
                }
            }
            None => {
                self.exchange(client_id, client_secret, Grant::ClientCredentials)
                    .await?
            }
        };

        self.store(token.clone());
        Ok(token)
    }

    pub fn cached(&self) -> Option<CachedToken> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[cfg(test)]
    pub fn prime(&self, token: CachedToken) {
        self.store(token);
    }

    fn store(&self, token: CachedToken) {
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = Some(token);
    }

    async fn exchange(
        &self,
        client_id: &str,
        client_secret: &str,
        grant: Grant,
    ) -> Result<CachedToken, PublishError> {
        let mut params: Vec<(&str, &str)> = vec![
            ("grant_type", grant.name()),
            ("client_id", client_id),
            ("client_secret", client_secret),
        ];
        if let Grant::Refresh(refresh) = &grant {
            params.push(("refresh_token", refresh.as_str()));
        }
        if let Some(scope) = self.config.scope.as_deref() {
            params.push(("scope", scope));
        }
        let url = self.config.token_url();
        let authorization = basic_auth_header(client_id, client_secret);
        debug!(target = "realty.directory", grant = grant.name(), "token_exchange");

        let token = self
            .breaker
            .fire_filtered(
                || async {
                    let response = self
                        .http
                        .post(&url)
                        .header(reqwest::header::AUTHORIZATION, &authorization)
                        .form(&params)
                        .send()
                        .await
                        .map_err(|err| PublishError::from_transport("token request", &err))?;

                    let status = response.status();
                    if status.as_u16() == 429 || status.is_server_error() {
                        let raw = response.json::<Value>().await.unwrap_or(Value::Null);
                        return Err(error_for_status(status.as_u16(), raw));
                    }
                    if !status.is_success() {
                        let raw = response.json::<Value>().await.unwrap_or(Value::Null);
                        return Err(PublishError::oauth(format!(
                            "token endpoint answered HTTP {status}"
                        ))
                        .with_status(status.as_u16())
                        .with_raw(raw));
                    }

                    let payload: TokenResponse = response.json().await.map_err(|err| {
                        PublishError::oauth(format!("invalid token response: {err}"))
                    })?;
                    Ok(payload)
                },
                PublishError::counts_against_breaker,
            )
            .await
            .map_err(PublishError::from_breaker)?;

        info!(
            target = "realty.directory",
            grant = grant.name(),
            expires_in = token.expires_in,
            "token_refreshed"
        );
        Ok(CachedToken {
            access_token: token.access_token,
            token_type: token.token_type,
            expires_at: Utc::now() + ChronoDuration::seconds(token.expires_in.max(0)),
            refresh_token: token.refresh_token,
        })
    }
}

fn basic_auth_header(client_id: &str, client_secret: &str) -> String {
    format!("Basic {}", BASE64.encode(format!("{client_id}:{client_secret}")))
}
