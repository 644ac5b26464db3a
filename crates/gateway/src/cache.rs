//! The result cache: completed `return_value` subtrees keyed by
//! `(call name, initial input)`.
//!
//! Backing is optional. When disabled, gets always miss and sets are no-ops.
//! Only the shared/remote tier is used; there is no in-process LRU in front
//! of it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bolt_contracts::CacheSection;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::config::StartupError;

const KEY_SEPARATOR: &str = "$$$";

#[derive(Clone)]
pub struct ResultCache {
    backend: Backend,
    op_timeout: Duration,
}

#[derive(Clone)]
enum Backend {
    Disabled,
    Redis(ConnectionManager),
    Memory(Arc<Mutex<HashMap<String, MemoryEntry>>>),
}

#[derive(Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl ResultCache {
    /// Connects the configured backend. An empty type disables caching.
    pub async fn setup(config: &CacheSection) -> Result<Self, StartupError> {
        let op_timeout = Duration::from_millis(config.timeout_ms.max(1) as u64);
        let backend = match config.kind.as_str() {
            "" => Backend::Disabled,
            "redis" => {
                let url = if config.pass.is_empty() {
                    format!("redis://{}", config.host)
                } else {
                    format!("redis://:{}@{}", config.pass, config.host)
                };
                let client = redis::Client::open(url).map_err(|_| StartupError {
                    code: "ERR_CACHE_UNAVAILABLE",
                    message: "invalid cache host".to_string(),
                })?;
                let manager = tokio::time::timeout(op_timeout, ConnectionManager::new(client))
                    .await
                    .map_err(|_| StartupError {
                        code: "ERR_CACHE_UNAVAILABLE",
                        message: "timed out connecting to cache".to_string(),
                    })?
                    .map_err(|err| StartupError {
                        code: "ERR_CACHE_UNAVAILABLE",
                        message: format!("failed to connect to cache: {err}"),
                    })?;
                Backend::Redis(manager)
            }
            "memory" => Backend::Memory(Arc::new(Mutex::new(HashMap::new()))),
            other => {
                return Err(StartupError {
                    code: "ERR_INVALID_CONFIG",
                    message: format!("unsupported cache type: {other}"),
                });
            }
        };
        Ok(Self { backend, op_timeout })
    }

    pub fn disabled() -> Self {
        Self {
            backend: Backend::Disabled,
            op_timeout: Duration::from_secs(2),
        }
    }

    #[cfg(test)]
    pub fn memory() -> Self {
        Self {
            backend: Backend::Memory(Arc::new(Mutex::new(HashMap::new()))),
            op_timeout: Duration::from_secs(2),
        }
    }

    pub fn enabled(&self) -> bool {
        !matches!(self.backend, Backend::Disabled)
    }

    /// The cache fingerprint for an api call + its initial input snapshot.
    pub fn key(call_name: &str, input_json: &str) -> String {
        format!("{call_name}{KEY_SEPARATOR}{input_json}")
    }

    pub async fn get(&self, call_name: &str, input_json: &str) -> Option<String> {
        let key = Self::key(call_name, input_json);
        match &self.backend {
            Backend::Disabled => None,
            Backend::Redis(manager) => {
                let mut conn = manager.clone();
                let lookup = conn.get::<_, Option<String>>(&key);
                match tokio::time::timeout(self.op_timeout, lookup).await {
                    Ok(Ok(value)) => value,
                    Ok(Err(err)) => {
                        tracing::warn!(key = %key, error = %err, "cache_error");
                        None
                    }
                    Err(_) => {
                        tracing::warn!(key = %key, "cache_timeout");
                        None
                    }
                }
            }
            Backend::Memory(map) => {
                let map = map.lock().expect("cache map lock");
                map.get(&key).and_then(|entry| {
                    let live = entry.expires_at.map(|at| at > Instant::now()).unwrap_or(true);
                    live.then(|| entry.value.clone())
                })
            }
        }
    }

    pub async fn set(&self, call_name: &str, input_json: &str, value: &str, ttl: Duration) {
        let key = Self::key(call_name, input_json);
        match &self.backend {
            Backend::Disabled => {}
            Backend::Redis(manager) => {
                let mut conn = manager.clone();
                let write = async {
                    if ttl.is_zero() {
                        conn.set::<_, _, ()>(&key, value).await
                    } else {
                        conn.set_ex::<_, _, ()>(&key, value, ttl.as_secs().max(1)).await
                    }
                };
                match tokio::time::timeout(self.op_timeout, write).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => tracing::warn!(key = %key, error = %err, "cache_error"),
                    Err(_) => tracing::warn!(key = %key, "cache_timeout"),
                }
            }
            Backend::Memory(map) => {
                let expires_at = (!ttl.is_zero()).then(|| Instant::now() + ttl);
                map.lock().expect("cache map lock").insert(
                    key,
                    MemoryEntry {
                        value: value.to_string(),
                        expires_at,
                    },
                );
            }
        }
    }

    pub async fn delete(&self, call_name: &str, input_json: &str) {
        let key = Self::key(call_name, input_json);
        match &self.backend {
            Backend::Disabled => {}
            Backend::Redis(manager) => {
                let mut conn = manager.clone();
                let drop = conn.del::<_, ()>(&key);
                match tokio::time::timeout(self.op_timeout, drop).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => tracing::warn!(key = %key, error = %err, "cache_error"),
                    Err(_) => tracing::warn!(key = %key, "cache_timeout"),
                }
            }
            Backend::Memory(map) => {
                map.lock().expect("cache map lock").remove(&key);
            }
        }
    }
}
