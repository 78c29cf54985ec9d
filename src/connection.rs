//! Managed database connections.
//!
//! One record per connection type, created once and shared. Initialization
//! is idempotent and guarded by an initializing flag; establishing a
//! connection pings the server under a connect timeout with bounded retries.
//! Missing or unknown drivers are startup-fatal configuration errors.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use mongodb::bson::doc;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::error::{TejasError, TejasResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    Redis,
    Mongodb,
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionKind::Redis => write!(f, "redis"),
            ConnectionKind::Mongodb => write!(f, "mongodb"),
        }
    }
}

impl FromStr for ConnectionKind {
    type Err = TejasError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(ConnectionKind::Redis),
            "mongodb" | "mongo" => Ok(ConnectionKind::Mongodb),
            other => Err(TejasError::Unsupported(format!(
                "unknown connection type: {}",
                other
            ))),
        }
    }
}

/// The driver client behind a record.
#[derive(Clone)]
pub enum ConnectionClient {
    Redis(redis::Client),
    RedisCluster(redis::cluster::ClusterClient),
    Mongo(mongodb::Client),
}

impl std::fmt::Debug for ConnectionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionClient::Redis(_) => f.debug_tuple("Redis").finish(),
            ConnectionClient::RedisCluster(_) => f.debug_tuple("RedisCluster").finish(),
            ConnectionClient::Mongo(_) => f.debug_tuple("Mongo").finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub url: String,
    /// Redis only: connect through the cluster client.
    pub cluster: bool,
    pub max_retries: u32,
    pub connect_timeout_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            cluster: false,
            max_retries: 3,
            connect_timeout_ms: 10_000,
        }
    }
}

impl ConnectionSettings {
    pub fn url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// An established connection plus the settings that produced it.
#[derive(Debug)]
pub struct ConnectionRecord {
    pub kind: ConnectionKind,
    pub client: ConnectionClient,
    pub settings: ConnectionSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub exists: bool,
    pub initializing: bool,
}

/// Keyed set of live connections. Lookups after initialization take a read
/// lock only; the initializing set sits behind its own mutex.
#[derive(Default)]
pub struct ConnectionManager {
    records: tokio::sync::RwLock<HashMap<ConnectionKind, Arc<ConnectionRecord>>>,
    initializing: std::sync::Mutex<HashSet<ConnectionKind>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Establishes a connection of `kind`, or returns the existing record.
    pub async fn initialize(
        &self,
        kind: ConnectionKind,
        settings: ConnectionSettings,
    ) -> TejasResult<Arc<ConnectionRecord>> {
        if let Some(existing) = self.records.read().await.get(&kind) {
            return Ok(Arc::clone(existing));
        }

        {
            let mut initializing = self.initializing.lock().expect("init lock poisoned");
            if !initializing.insert(kind) {
                return Err(TejasError::ConnectionFailed(format!(
                    "{} connection is already initializing",
                    kind
                )));
            }
        }

        let outcome = self.connect(kind, &settings).await;
        self.initializing
            .lock()
            .expect("init lock poisoned")
            .remove(&kind);

        let client = outcome?;
        let record = Arc::new(ConnectionRecord {
            kind,
            client,
            settings,
        });
        self.records.write().await.insert(kind, Arc::clone(&record));
        info!(kind = %kind, "connection established");
        Ok(record)
    }

    pub async fn get(&self, kind: ConnectionKind) -> Option<Arc<ConnectionRecord>> {
        self.records.read().await.get(&kind).cloned()
    }

    pub async fn has(&self, kind: ConnectionKind) -> ConnectionStatus {
        let exists = self.records.read().await.contains_key(&kind);
        let initializing = self
            .initializing
            .lock()
            .expect("init lock poisoned")
            .contains(&kind);
        ConnectionStatus {
            exists,
            initializing,
        }
    }

    /// Closes one connection, waiting for the driver to wind down.
    pub async fn close(&self, kind: ConnectionKind) {
        let record = self.records.write().await.remove(&kind);
        if let Some(record) = record {
            if let ConnectionClient::Mongo(client) = &record.client {
                client.clone().shutdown().await;
            }
            // Redis clients release their sockets when the last handle drops.
            info!(kind = %kind, "connection closed");
        }
    }

    /// Closes every connection in parallel.
    pub async fn close_all(&self) {
        let kinds: Vec<ConnectionKind> = self.records.read().await.keys().copied().collect();
        futures::future::join_all(kinds.into_iter().map(|kind| self.close(kind))).await;
    }

    async fn connect(
        &self,
        kind: ConnectionKind,
        settings: &ConnectionSettings,
    ) -> TejasResult<ConnectionClient> {
        match kind {
            ConnectionKind::Redis => self.connect_redis(settings).await,
            ConnectionKind::Mongodb => self.connect_mongo(settings).await,
        }
    }

    async fn connect_redis(&self, settings: &ConnectionSettings) -> TejasResult<ConnectionClient> {
        let deadline = Duration::from_millis(settings.connect_timeout_ms);
        let attempts = settings.max_retries.max(1);
        let mut last_error = String::new();

        if settings.cluster {
            let client = redis::cluster::ClusterClient::new(vec![settings.url.clone()])
                .map_err(|e| TejasError::ConnectionFailed(e.to_string()))?;
            for attempt in 1..=attempts {
                let probe = async {
                    let mut conn = client.get_async_connection().await?;
                    redis::cmd("PING").query_async::<_, String>(&mut conn).await
                };
                match timeout(deadline, probe).await {
                    Ok(Ok(_)) => return Ok(ConnectionClient::RedisCluster(client)),
                    Ok(Err(e)) => {
                        warn!(attempt, "redis cluster connect failed: {}", e);
                        last_error = e.to_string();
                    }
                    Err(_) => {
                        warn!(attempt, "redis cluster connect timed out");
                        last_error = "connect timeout".to_string();
                    }
                }
            }
        } else {
            let client = redis::Client::open(settings.url.as_str())
                .map_err(|e| TejasError::ConnectionFailed(e.to_string()))?;
            for attempt in 1..=attempts {
                let probe = async {
                    let mut conn = client.get_multiplexed_async_connection().await?;
                    redis::cmd("PING").query_async::<_, String>(&mut conn).await
                };
                match timeout(deadline, probe).await {
                    Ok(Ok(_)) => return Ok(ConnectionClient::Redis(client)),
                    Ok(Err(e)) => {
                        warn!(attempt, "redis connect failed: {}", e);
                        last_error = e.to_string();
                    }
                    Err(_) => {
                        warn!(attempt, "redis connect timed out");
                        last_error = "connect timeout".to_string();
                    }
                }
            }
        }

        Err(TejasError::ConnectionFailed(format!(
            "redis unreachable after {} attempts: {}",
            attempts, last_error
        )))
    }

    async fn connect_mongo(&self, settings: &ConnectionSettings) -> TejasResult<ConnectionClient> {
        let deadline = Duration::from_millis(settings.connect_timeout_ms);

        let options = timeout(
            deadline,
            mongodb::options::ClientOptions::parse(settings.url.as_str()),
        )
        .await
        .map_err(|_| TejasError::ConnectionFailed("mongodb option parse timed out".to_string()))?
        .map_err(|e| TejasError::ConnectionFailed(e.to_string()))?;

        let client = mongodb::Client::with_options(options)
            .map_err(|e| TejasError::ConnectionFailed(e.to_string()))?;

        match timeout(
            deadline,
            client.database("admin").run_command(doc! {"ping": 1}, None),
        )
        .await
        {
            Ok(Ok(_)) => Ok(ConnectionClient::Mongo(client)),
            Ok(Err(e)) => Err(TejasError::ConnectionFailed(e.to_string())),
            Err(_) => {
                // Best effort teardown before rejecting.
                client.clone().shutdown().await;
                Err(TejasError::ConnectionFailed(
                    "mongodb connect timed out".to_string(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parsing() {
        assert_eq!("redis".parse::<ConnectionKind>().unwrap(), ConnectionKind::Redis);
        assert_eq!(
            "MongoDB".parse::<ConnectionKind>().unwrap(),
            ConnectionKind::Mongodb
        );
        assert_eq!(
            "mongo".parse::<ConnectionKind>().unwrap(),
            ConnectionKind::Mongodb
        );
        assert!("postgres".parse::<ConnectionKind>().is_err());
    }

    #[tokio::test]
    async fn test_status_of_unknown_connection() {
        let manager = ConnectionManager::new();
        let status = manager.has(ConnectionKind::Redis).await;
        assert!(!status.exists);
        assert!(!status.initializing);
        assert!(manager.get(ConnectionKind::Redis).await.is_none());
    }

    #[tokio::test]
    async fn test_close_all_on_empty_manager() {
        let manager = ConnectionManager::new();
        manager.close_all().await;
    }

    #[tokio::test]
    async fn test_unreachable_redis_fails_after_retries() {
        let manager = ConnectionManager::new();
        let settings = ConnectionSettings {
            url: "redis://127.0.0.1:1".to_string(),
            cluster: false,
            max_retries: 1,
            connect_timeout_ms: 300,
        };
        let err = manager
            .initialize(ConnectionKind::Redis, settings)
            .await
            .unwrap_err();
        assert!(matches!(err, TejasError::ConnectionFailed(_)));
        // The initializing flag is cleared on failure.
        let status = manager.has(ConnectionKind::Redis).await;
        assert!(!status.exists);
        assert!(!status.initializing);
    }
}
