use crate::models::PublishAccepted;
use redis::AsyncCommands;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::debug;

/// Remembers accepted publish requests by `Idempotency-Key`.
///
/// Uses Redis when `REDIS_URL` is set, otherwise a process-local map.
#[derive(Clone)]
pub struct IdempotencyCache {
    redis: Option<redis::Client>,
    memory: Arc<Mutex<HashMap<String, PublishAccepted>>>,
    ttl_secs: u64,
}

impl IdempotencyCache {
    pub fn from_env() -> Self {
        let mut cache = Self::in_memory();
        cache.redis = std::env::var("REDIS_URL")
            .ok()
            .and_then(|u| redis::Client::open(u).ok());
        if let Some(ttl_secs) = std::env::var("IDEMPOTENCY_TTL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            cache.ttl_secs = ttl_secs;
        }
        cache
    }

    /// Process-local only; also the fallback when `REDIS_URL` is unset.
    pub fn in_memory() -> Self {
        Self {
            redis: None,
            memory: Arc::new(Mutex::new(HashMap::new())),
            ttl_secs: 3600,
        }
    }

    pub fn scoped_key(agent_id: &str, listing_id: &uuid::Uuid, key: &str) -> String {
        format!("publish:{agent_id}:{listing_id}:{key}")
    }

    pub async fn get(&self, key: &str) -> Option<PublishAccepted> {
        match &self.redis {
            Some(client) => redis_get(client, key).await,
            None => self.memory.lock().await.get(key).cloned(),
        }
    }

    pub async fn put(&self, key: &str, value: &PublishAccepted) {
        debug!(target = "realty.api", key = key, "idempotency_stored");
        match &self.redis {
            Some(client) => redis_set(client, key, value, self.ttl_secs).await,
            None => {
                self.memory
                    .lock()
                    .await
                    .insert(key.to_string(), value.clone());
            }
        }
    }
}

async fn redis_get(client: &redis::Client, key: &str) -> Option<PublishAccepted> {
    let mut conn = client.get_multiplexed_async_connection().await.ok()?;
    let s: Option<String> = conn.get(key).await.ok();
    s.and_then(|v| serde_json::from_str(&v).ok())
}

async fn redis_set(client: &redis::Client, key: &str, value: &PublishAccepted, ttl_secs: u64) {
    if let Ok(mut conn) = client.get_multiplexed_async_connection().await
        && let Ok(json) = serde_json::to_string(value)
    {
        let _: Result<(), _> = conn.set_ex(key, json, ttl_secs).await;
    }
}
