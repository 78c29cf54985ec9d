//! Framework shell.
//!
//! [`Tejas`] assembles the merged configuration, the endpoint registry, the
//! optional cache and rate limiter, and the managed connections, then starts
//! the listener with `takeoff`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info};

use crate::cache::CacheStore;
use crate::config::Config;
use crate::connection::{ConnectionKind, ConnectionManager, ConnectionSettings};
use crate::dispatch::AppState;
use crate::error::{TejasError, TejasResult};
use crate::middleware::Middleware;
use crate::rate_limiter::{rate_limit_middleware, RateLimitOptions, RateLimiter};
use crate::router::{Endpoint, Registry, Target};
use crate::server;

/// The application shell.
pub struct Tejas {
    config: Config,
    registry: Registry,
    connections: Arc<ConnectionManager>,
    cache: Option<Arc<CacheStore>>,
    limiter: Option<Arc<RateLimiter>>,
}

impl Tejas {
    /// Builds a shell from `tejas.config.json` and the environment.
    pub fn new() -> TejasResult<Self> {
        Self::with_options(Value::Null)
    }

    /// Builds a shell with explicit options layered on top of the file and
    /// the environment.
    pub fn with_options(options: Value) -> TejasResult<Self> {
        let config =
            Config::load_with(options).map_err(|e| TejasError::Config(e.to_string()))?;

        let cache = match &config.cache_size {
            Some(size) => {
                let log_enabled = config
                    .get("CACHE_LOG")
                    .map(|v| matches!(v, "1" | "true" | "yes" | "on"))
                    .unwrap_or(false);
                Some(Arc::new(CacheStore::new(size)?.with_logging(log_enabled)))
            }
            None => None,
        };

        Ok(Self {
            config,
            registry: Registry::new(),
            connections: Arc::new(ConnectionManager::new()),
            cache,
            limiter: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Registers every endpoint of a target under its prefix.
    pub fn board(&mut self, target: Target) -> TejasResult<&mut Self> {
        for endpoint in target.into_endpoints()? {
            self.registry.register(endpoint);
        }
        Ok(self)
    }

    /// Registers one endpoint.
    pub fn register(&mut self, endpoint: Endpoint) -> &mut Self {
        self.registry.register(endpoint);
        self
    }

    /// Appends a global middleware; it runs before every endpoint chain.
    pub fn plug(&mut self, middleware: Middleware) -> &mut Self {
        self.registry.add_global(middleware);
        self
    }

    /// Installs a global rate limiter as the next global middleware.
    pub fn with_rate_limiter(&mut self, options: RateLimitOptions) -> TejasResult<&mut Self> {
        let limiter = Arc::new(RateLimiter::new(options)?);
        self.registry
            .add_global(rate_limit_middleware(Arc::clone(&limiter)));
        self.limiter = Some(limiter);
        Ok(self)
    }

    pub fn rate_limiter(&self) -> Option<Arc<RateLimiter>> {
        self.limiter.clone()
    }

    pub fn cache(&self) -> Option<Arc<CacheStore>> {
        self.cache.clone()
    }

    pub fn connections(&self) -> Arc<ConnectionManager> {
        Arc::clone(&self.connections)
    }

    /// Starts the listener and serves until shutdown. Configuration and
    /// listen failures abort; connection failures are logged and the
    /// affected handlers answer 500 when they reach for the missing client.
    pub async fn takeoff(self) -> TejasResult<()> {
        let Tejas {
            config,
            registry,
            connections,
            cache: _cache,
            limiter: _limiter,
        } = self;

        if let Some(dir) = &config.dir_targets {
            let files = discover_targets(Path::new(dir));
            info!(dir = %dir, count = files.len(), "discovered target files");
            for file in &files {
                debug!(file = %file.display(), "target file");
            }
        }

        if let Some(url) = &config.redis_url {
            let settings = ConnectionSettings {
                url: url.clone(),
                cluster: config.redis_cluster,
                ..ConnectionSettings::default()
            };
            if let Err(e) = connections
                .initialize(ConnectionKind::Redis, settings)
                .await
            {
                error!("redis connection failed: {}", e);
            }
        }
        if let Some(url) = &config.mongo_url {
            let settings = ConnectionSettings::url(url.clone());
            if let Err(e) = connections
                .initialize(ConnectionKind::Mongodb, settings)
                .await
            {
                error!("mongodb connection failed: {}", e);
            }
        }

        let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
        let state = Arc::new(AppState { registry, config });

        let outcome = server::serve(state, addr).await;
        connections.close_all().await;
        outcome
    }
}

/// Recursively enumerates regular files named `*target.<ext>` under `dir`,
/// in filesystem order. Registration itself happens through [`Target`]
/// values; the scan verifies the deployed layout.
pub fn discover_targets(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    walk(dir, &mut out);
    out
}

fn walk(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk(&path, out);
        } else if is_target_file(&path) {
            out.push(path);
        }
    }
}

fn is_target_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|name| name.rsplit_once('.'))
        .map(|(stem, _ext)| stem.ends_with("target"))
        .unwrap_or(false)
}
