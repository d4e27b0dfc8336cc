use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, env, sync::Arc};
use tracing::{info, warn};

pub const AGENCY_KEY_HEADER: &str = "X-Agency-Key";

#[derive(Clone)]
pub struct AuthState {
    records: Arc<HashMap<String, AgentContext>>,
}

/// The authenticated caller. `agent_id` doubles as submitter identity.
#[derive(Clone, Debug)]
pub struct AgentContext {
    pub agent_id: String,
    pub key_id: String,
}

impl AuthState {
    pub fn from_env() -> Self {
        Self::from_list(&env::var("AGENCY_API_KEYS").unwrap_or_default())
    }

    /// Parses `agent:key,agent:key`. Malformed entries are skipped.
    pub fn from_list(raw: &str) -> Self {
        let mut records = HashMap::new();
        for (idx, entry) in raw.split(',').enumerate() {
            let trimmed = entry.trim();
            if trimmed.is_empty() {
                continue;
            }
            match trimmed.split_once(':') {
                Some((agent, key)) if !agent.trim().is_empty() && !key.trim().is_empty() => {
                    records.insert(
                        key.trim().to_string(),
                        AgentContext {
                            agent_id: agent.trim().to_string(),
                            key_id: format!("key-{:02}", idx + 1),
                        },
                    );
                }
                _ => warn!(
                    target = "realty.api",
                    position = idx + 1,
                    "agency_key_entry_malformed"
                ),
            }
        }

        if records.is_empty() {
            warn!(
                target = "realty.api",
                "AGENCY_API_KEYS produced no keys; protected routes will reject every request"
            );
        } else {
            info!(
                target = "realty.api",
                key_count = records.len(),
                "agency_keys_loaded"
            );
        }
        Self {
            records: Arc::new(records),
        }
    }

    fn authenticate(&self, presented: &str) -> Option<AgentContext> {
        self.records.get(presented).cloned()
    }
}

pub async fn require_api_auth(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_api_key(request.headers()) else {
        return Ok(unauthorized_response(
            "missing_api_key",
            "Provide X-Agency-Key or a Bearer token",
        ));
    };

    let Some(context) = state.authenticate(&presented) else {
        return Ok(unauthorized_response("invalid_api_key", "Key not recognized"));
    };

    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}

fn extract_api_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string()).filter(|key| !key.is_empty());
    }
    headers
        .get(AGENCY_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn unauthorized_response(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
        correlation_id: None,
    };
    (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
}
