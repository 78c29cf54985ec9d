//! Storage backends for the rate limiter.
//!
//! Limiter records are JSON text keyed by the limiter key. Both backends
//! expire records: the memory store lazily on read, Redis through `EX`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{TejasError, TejasResult};

/// Key/value contract the limiter algorithms run against.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Fetches a record; expired entries read as `None`.
    async fn get(&self, key: &str) -> TejasResult<Option<String>>;

    /// Replaces a record with a fresh TTL.
    async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> TejasResult<()>;

    /// Atomically increments a numeric counter, returning the new value, or
    /// `None` when the key has no live record.
    async fn incr(&self, key: &str) -> TejasResult<Option<i64>>;

    async fn delete(&self, key: &str) -> TejasResult<()>;
}

struct MemoryRecord {
    value: String,
    expires_at_ms: u64,
}

/// In-process store. A single lock serializes every operation; expired
/// records are dropped the next time their key is touched.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, MemoryRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().expect("store lock poisoned").len()
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn get(&self, key: &str) -> TejasResult<Option<String>> {
        let mut entries = self.entries.lock().expect("store lock poisoned");
        let now = epoch_ms();
        match entries.get(key) {
            Some(record) if record.expires_at_ms > now => Ok(Some(record.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> TejasResult<()> {
        let mut entries = self.entries.lock().expect("store lock poisoned");
        entries.insert(
            key.to_string(),
            MemoryRecord {
                value: value.to_string(),
                expires_at_ms: epoch_ms() + ttl_secs * 1000,
            },
        );
        Ok(())
    }

    async fn incr(&self, key: &str) -> TejasResult<Option<i64>> {
        let mut entries = self.entries.lock().expect("store lock poisoned");
        let now = epoch_ms();
        match entries.get_mut(key) {
            Some(record) if record.expires_at_ms > now => {
                let current: i64 = record.value.parse().map_err(|_| {
                    TejasError::Storage(format!("non-numeric counter under key {}", key))
                })?;
                let next = current + 1;
                record.value = next.to_string();
                Ok(Some(next))
            }
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> TejasResult<()> {
        let mut entries = self.entries.lock().expect("store lock poisoned");
        entries.remove(key);
        Ok(())
    }
}

/// Redis-backed store. Records are plain strings set with `EX`; every
/// operation is bounded by an operation timeout.
pub struct RedisStore {
    client: redis::Client,
    op_timeout: Duration,
}

impl RedisStore {
    pub fn new(redis_url: &str) -> TejasResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| TejasError::Storage(format!("failed to create Redis client: {}", e)))?;
        debug!(url = redis_url, "rate limit store using Redis");
        Ok(Self {
            client,
            op_timeout: Duration::from_secs(5),
        })
    }

    async fn connection(&self) -> TejasResult<redis::aio::MultiplexedConnection> {
        timeout(self.op_timeout, self.client.get_multiplexed_async_connection())
            .await
            .map_err(|_| TejasError::StorageTimeout("Redis connection timeout".to_string()))?
            .map_err(|e| TejasError::Storage(format!("failed to get connection: {}", e)))
    }

    fn storage_error(error: redis::RedisError, operation: &str) -> TejasError {
        if error.is_timeout() {
            warn!("Redis timeout during {}: {}", operation, error);
            TejasError::StorageTimeout(format!("timed out during {}", operation))
        } else {
            warn!("Redis error during {}: {}", operation, error);
            TejasError::Storage(format!("Redis error during {}: {}", operation, error))
        }
    }
}

#[async_trait]
impl RateLimitStore for RedisStore {
    async fn get(&self, key: &str) -> TejasResult<Option<String>> {
        let mut conn = self.connection().await?;
        let value: Option<String> = timeout(self.op_timeout, conn.get(key))
            .await
            .map_err(|_| TejasError::StorageTimeout("get timed out".to_string()))?
            .map_err(|e| Self::storage_error(e, "get"))?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> TejasResult<()> {
        let mut conn = self.connection().await?;
        let () = timeout(self.op_timeout, conn.set_ex(key, value, ttl_secs))
            .await
            .map_err(|_| TejasError::StorageTimeout("set timed out".to_string()))?
            .map_err(|e| Self::storage_error(e, "set"))?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> TejasResult<Option<i64>> {
        let mut conn = self.connection().await?;
        let exists: bool = timeout(self.op_timeout, conn.exists(key))
            .await
            .map_err(|_| TejasError::StorageTimeout("incr timed out".to_string()))?
            .map_err(|e| Self::storage_error(e, "incr"))?;
        if !exists {
            return Ok(None);
        }
        let next: i64 = timeout(self.op_timeout, conn.incr(key, 1i64))
            .await
            .map_err(|_| TejasError::StorageTimeout("incr timed out".to_string()))?
            .map_err(|e| Self::storage_error(e, "incr"))?;
        Ok(Some(next))
    }

    async fn delete(&self, key: &str) -> TejasResult<()> {
        let mut conn = self.connection().await?;
        let _: u64 = timeout(self.op_timeout, conn.del(key))
            .await
            .map_err(|_| TejasError::StorageTimeout("delete timed out".to_string()))?
            .map_err(|e| Self::storage_error(e, "delete"))?;
        Ok(())
    }
}

pub(crate) fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
