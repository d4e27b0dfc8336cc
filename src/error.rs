use crate::models::AttemptStatus;
use crate::resilience::BreakerError;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ConfigError,
    OauthError,
    ValidationError,
    Timeout,
    NetworkError,
    CircuitOpen,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConfigError => "CONFIG_ERROR",
            ErrorCode::OauthError => "OAUTH_ERROR",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::CircuitOpen => "CIRCUIT_OPEN",
        }
    }
}

/// Typed failure of a publish, carrying what an attempt row needs.
#[derive(Debug, Clone, Error)]
#[error("{}: {message}", .code.as_str())]
pub struct PublishError {
    code: ErrorCode,
    message: String,
    http_status: Option<u16>,
    raw: Option<Value>,
}

impl PublishError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            http_status: None,
            raw: None,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigError, message)
    }

    pub fn oauth(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::OauthError, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NetworkError, message)
    }

    pub fn circuit_open(dependency: &str) -> Self {
        Self::new(
            ErrorCode::CircuitOpen,
            format!("{dependency} is temporarily unavailable (circuit open)"),
        )
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_raw(mut self, raw: Value) -> Self {
        self.raw = Some(raw);
        self
    }

    /// Collapses a breaker outcome; inner errors are already typed.
    pub fn from_breaker(err: BreakerError<PublishError>) -> Self {
        match err {
            BreakerError::Open { name } => Self::circuit_open(name),
            BreakerError::Timeout { name, after } => {
                Self::timeout(format!("{name} call exceeded {}ms", after.as_millis()))
            }
            BreakerError::Inner(inner) => inner,
        }
    }

    /// Maps a transport error, keeping client-side timeouts distinct.
    pub fn from_transport(context: &str, err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::timeout(format!("{context}: {err}"))
        } else {
            Self::network(format!("{context}: {err}"))
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn http_status(&self) -> Option<u16> {
        self.http_status
    }

    pub fn raw(&self) -> Option<&Value> {
        self.raw.as_ref()
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::Timeout | ErrorCode::NetworkError | ErrorCode::CircuitOpen
        )
    }

    /// Rejections of the request itself (bad fields, bad credentials) mean
    /// the dependency answered, so they are not outage signals.
    pub fn counts_against_breaker(&self) -> bool {
        !matches!(
            self.code,
            ErrorCode::ValidationError | ErrorCode::OauthError
        )
    }

    pub fn attempt_status(&self) -> AttemptStatus {
        match (self.code, self.http_status) {
            (ErrorCode::Timeout, _) => AttemptStatus::Timeout,
            (_, Some(429)) => AttemptStatus::RateLimited,
            _ => AttemptStatus::Failed,
        }
    }

    /// Short text that is safe to show to an end user.
    pub fn user_message(&self) -> &'static str {
        match self.code {
            ErrorCode::CircuitOpen => {
                "The listing directory is temporarily unavailable, please retry later."
            }
            ErrorCode::Timeout => "The listing directory did not respond in time, please retry.",
            ErrorCode::NetworkError => "Could not reach the listing directory, please retry.",
            ErrorCode::ValidationError => {
                "The listing directory rejected this listing; please review its details."
            }
            ErrorCode::ConfigError | ErrorCode::OauthError => {
                "Publishing is not configured correctly; please contact support."
            }
        }
    }
}
