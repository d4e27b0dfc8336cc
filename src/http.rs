use reqwest::Client;
use std::time::Duration;
use tracing::warn;

/// Outer budgets shared by every directory call. Breaker timeouts are
/// expected to sit below `timeout` so the breaker fires first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSettings {
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl HttpSettings {
    pub fn from_env() -> Self {
        Self {
            timeout: secs_or(std::env::var("HTTP_TIMEOUT_SECS").ok(), 15),
            connect_timeout: secs_or(std::env::var("HTTP_CONNECT_TIMEOUT_SECS").ok(), 5),
        }
    }

    pub fn client(&self) -> Client {
        Client::builder()
            .timeout(self.timeout)
            .connect_timeout(self.connect_timeout)
            .user_agent(concat!("realty-publisher/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|err| {
                warn!(target = "realty.directory", error = %err, "http_client_fallback");
                Client::new()
            })
    }
}

fn secs_or(raw: Option<String>, default: u64) -> Duration {
    let secs = raw
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default);
    Duration::from_secs(secs)
}
