use crate::models::PipelineRunResponse;
use redis::AsyncCommands;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::Mutex, time::Instant};
use tracing::warn;

/// Replays completed pipeline runs by `Idempotency-Key`. Failed runs are never
/// stored, so a retry after a failure starts from the beginning. Both variants
/// forget a key `ttl_secs` after it was stored.
#[derive(Clone)]
pub enum IdempotencyStore {
    Redis { client: redis::Client, ttl_secs: u64 },
    Memory { entries: MemoryEntries, ttl: Duration },
}

type MemoryEntries = Arc<Mutex<HashMap<String, (Instant, PipelineRunResponse)>>>;

impl IdempotencyStore {
    pub fn new(redis_url: Option<&str>, ttl_secs: u64) -> Self {
        match redis_url.map(redis::Client::open) {
            Some(Ok(client)) => Self::Redis { client, ttl_secs },
            Some(Err(err)) => {
                warn!(target = "studio.api", error = %err, "redis_url_invalid_using_memory");
                Self::memory(ttl_secs)
            }
            None => Self::memory(ttl_secs),
        }
    }

    pub fn memory(ttl_secs: u64) -> Self {
        Self::Memory {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    pub async fn get(&self, key: &str) -> Option<PipelineRunResponse> {
        match self {
            Self::Redis { client, .. } => redis_get(client, key).await,
            Self::Memory { entries, ttl } => {
                let mut entries = entries.lock().await;
                let fresh = entries
                    .get(key)
                    .filter(|(stored, _)| stored.elapsed() < *ttl)
                    .map(|(_, response)| response.clone());
                if fresh.is_none() {
                    entries.remove(key);
                }
                fresh
            }
        }
    }

    pub async fn put(&self, key: String, value: &PipelineRunResponse) {
        match self {
            Self::Redis { client, ttl_secs } => redis_set(client, &key, value, *ttl_secs).await,
            Self::Memory { entries, ttl } => {
                let mut entries = entries.lock().await;
                entries.retain(|_, (stored, _)| stored.elapsed() < *ttl);
                entries.insert(key, (Instant::now(), value.clone()));
            }
        }
    }
}

async fn redis_get(client: &redis::Client, key: &str) -> Option<PipelineRunResponse> {
    let mut conn = match client.get_multiplexed_async_connection().await {
        Ok(c) => c,
        Err(err) => {
            warn!(target = "studio.api", error = %err, "redis_unavailable");
            return None;
        }
    };
    let s: Option<String> = conn.get(namespaced(key)).await.ok();
    s.and_then(|v| serde_json::from_str(&v).ok())
}

async fn redis_set(client: &redis::Client, key: &str, value: &PipelineRunResponse, ttl_secs: u64) {
    if let Ok(mut conn) = client.get_multiplexed_async_connection().await
        && let Ok(json) = serde_json::to_string(value)
    {
        let _: Result<(), _> = conn.set_ex(namespaced(key), json, ttl_secs).await;
    }
}

fn namespaced(key: &str) -> String {
    format!("studio:idempotency:{key}")
}
