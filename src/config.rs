use std::collections::HashMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;

use serde_json::Value;
use tracing::debug;

/// Name of the optional config file read from the process cwd.
pub const CONFIG_FILE: &str = "tejas.config.json";

/// Merged framework configuration.
///
/// Sources, lowest to highest precedence: `tejas.config.json` in the cwd,
/// then process environment, then explicit constructor options. All keys are
/// normalized to UPPER_SNAKE_CASE; nested objects flatten with `_`.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub body_max_size: usize,
    pub body_timeout_ms: u64,
    pub dir_targets: Option<String>,
    pub log_http_requests: bool,
    pub log_exceptions: bool,
    pub cache_size: Option<String>,
    pub redis_url: Option<String>,
    pub redis_cluster: bool,
    pub mongo_url: Option<String>,
    raw: HashMap<String, String>,
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort(String),
    InvalidBodySize(String),
    InvalidBodyTimeout(String),
    InvalidFile(String),
    InvalidOptions(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort(msg) => write!(f, "Invalid port: {}", msg),
            ConfigError::InvalidBodySize(msg) => write!(f, "Invalid body size: {}", msg),
            ConfigError::InvalidBodyTimeout(msg) => write!(f, "Invalid body timeout: {}", msg),
            ConfigError::InvalidFile(msg) => write!(f, "Invalid config file: {}", msg),
            ConfigError::InvalidOptions(msg) => write!(f, "Invalid options: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 1403,
            body_max_size: 10 * 1024 * 1024,
            body_timeout_ms: 30_000,
            dir_targets: None,
            log_http_requests: false,
            log_exceptions: false,
            cache_size: None,
            redis_url: None,
            redis_cluster: false,
            mongo_url: None,
            raw: HashMap::new(),
        }
    }
}

impl Config {
    /// Loads the config file and environment with no explicit options.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(Value::Null)
    }

    /// Loads the full merged configuration. `options` must be a JSON object
    /// (or null); it wins over both the file and the environment.
    pub fn load_with(options: Value) -> Result<Self, ConfigError> {
        let mut raw = HashMap::new();

        if Path::new(CONFIG_FILE).exists() {
            let text = fs::read_to_string(CONFIG_FILE)
                .map_err(|e| ConfigError::InvalidFile(e.to_string()))?;
            let file: Value = serde_json::from_str(&text)
                .map_err(|e| ConfigError::InvalidFile(e.to_string()))?;
            if !file.is_object() {
                return Err(ConfigError::InvalidFile(
                    "top level must be an object".to_string(),
                ));
            }
            flatten("", &file, &mut raw);
            debug!(keys = raw.len(), "loaded {}", CONFIG_FILE);
        }

        for (key, value) in env::vars() {
            raw.insert(normalize_key(&key), value);
        }

        match &options {
            Value::Null => {}
            Value::Object(_) => flatten("", &options, &mut raw),
            _ => {
                return Err(ConfigError::InvalidOptions(
                    "options must be an object".to_string(),
                ))
            }
        }

        Self::from_raw(raw)
    }

    fn from_raw(raw: HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self {
            raw,
            ..Self::default()
        };

        if let Some(port) = config.raw.get("PORT") {
            config.port = port
                .parse()
                .map_err(|_| ConfigError::InvalidPort(port.clone()))?;
        }

        if let Some(size) = config.raw.get("BODY_MAX_SIZE") {
            config.body_max_size = size
                .parse()
                .map_err(|_| ConfigError::InvalidBodySize(size.clone()))?;
        }

        if let Some(timeout) = config.raw.get("BODY_TIMEOUT") {
            config.body_timeout_ms = timeout
                .parse()
                .map_err(|_| ConfigError::InvalidBodyTimeout(timeout.clone()))?;
        }

        config.dir_targets = config.raw.get("DIR_TARGETS").cloned();
        config.log_http_requests = config
            .raw
            .get("LOG_HTTP_REQUESTS")
            .map(|v| is_truthy(v))
            .unwrap_or(false);
        config.log_exceptions = config
            .raw
            .get("LOG_EXCEPTIONS")
            .map(|v| is_truthy(v))
            .unwrap_or(false);
        config.cache_size = config.raw.get("CACHE_SIZE").cloned();
        config.redis_url = config.raw.get("REDIS_URL").cloned();
        config.redis_cluster = config
            .raw
            .get("REDIS_CLUSTER")
            .map(|v| is_truthy(v))
            .unwrap_or(false);
        config.mongo_url = config.raw.get("MONGO_URL").cloned();

        config.validate()?;
        Ok(config)
    }

    /// Raw access to any merged key, normalized form.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.raw.get(&normalize_key(key)).map(String::as_str)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidPort("Port cannot be 0".to_string()));
        }

        if self.body_max_size == 0 {
            return Err(ConfigError::InvalidBodySize(
                "Body size cap must be greater than 0".to_string(),
            ));
        }

        if self.body_timeout_ms == 0 {
            return Err(ConfigError::InvalidBodyTimeout(
                "Body timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn normalize_key(key: &str) -> String {
    key.trim().replace(['-', '.'], "_").to_ascii_uppercase()
}

/// Flattens a JSON object into UPPER_SNAKE keys, nesting joined by `_`.
/// Scalars become their string form, arrays keep their JSON text.
fn flatten(prefix: &str, value: &Value, out: &mut HashMap<String, String>) {
    if let Value::Object(map) = value {
        for (key, child) in map {
            let flat = if prefix.is_empty() {
                normalize_key(key)
            } else {
                format!("{}_{}", prefix, normalize_key(key))
            };
            match child {
                Value::Object(_) => flatten(&flat, child, out),
                Value::String(s) => {
                    out.insert(flat, s.clone());
                }
                Value::Null => {
                    out.insert(flat, String::new());
                }
                other => {
                    out.insert(flat, other.to_string());
                }
            }
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
