//! Pluggable rate limiter.
//!
//! A [`RateLimiter`] binds one algorithm to one storage backend and exposes
//! `consume`, the common surface every algorithm answers through a
//! [`Verdict`]. [`rate_limit_middleware`] wraps a limiter as a chain step
//! that stamps the rate-limit headers and rejects with 429.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::algorithms::fixed_window::{self, FixedWindowOptions};
use crate::algorithms::sliding_window::{self, SlidingWindowOptions};
use crate::algorithms::token_bucket::{self, TokenBucketOptions};
use crate::algorithms::{Algorithm, Verdict};
use crate::ammo::{Ammo, Responder};
use crate::error::{HttpError, TejasError, TejasResult};
use crate::key_generator::KeyGenerator;
use crate::middleware::{AmmoStep, Flow, Middleware};
use crate::store::{MemoryStore, RateLimitStore, RedisStore};

/// Which storage backend the limiter records live in.
#[derive(Debug, Clone, Default)]
pub enum StoreChoice {
    #[default]
    Memory,
    Redis(String),
}

/// Which header family goes out with each decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeaderKind {
    #[default]
    Standard,
    Legacy,
    Both,
}

#[derive(Debug, Clone, Default)]
pub struct HeaderFormat {
    pub kind: HeaderKind,
    /// Emit `RateLimit-Policy` alongside the standard triple.
    pub draft7: bool,
    /// Emit reset as delta seconds instead of an epoch timestamp.
    pub draft8: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TokenBucketConfig {
    /// Tokens per second; defaults to `max_requests / time_window_secs`.
    pub refill_rate: Option<f64>,
    /// Bucket capacity; defaults to `max_requests`.
    pub burst_size: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct SlidingWindowConfig {
    pub granularity_ms: u64,
    pub weight_current: f64,
    pub weight_previous: f64,
}

impl Default for SlidingWindowConfig {
    fn default() -> Self {
        Self {
            granularity_ms: 1000,
            weight_current: 1.0,
            weight_previous: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FixedWindowConfig {
    /// Align windows to the wall clock instead of the first request.
    pub strict_window: bool,
}

type KeyGeneratorFn = Arc<dyn Fn(&Ammo) -> Result<String, HttpError> + Send + Sync>;

/// Limiter configuration. The defaults allow 60 requests per 60 seconds out
/// of the in-memory store with a token bucket.
#[derive(Clone)]
pub struct RateLimitOptions {
    pub max_requests: u64,
    pub time_window_secs: u64,
    pub key_prefix: String,
    pub store: StoreChoice,
    pub algorithm: Algorithm,
    pub token_bucket: TokenBucketConfig,
    pub sliding_window: SlidingWindowConfig,
    pub fixed_window: FixedWindowConfig,
    pub header_format: HeaderFormat,
    /// Derives the identifier from the request; defaults to the client IP.
    pub key_generator: Option<KeyGeneratorFn>,
    /// Terminal step invoked instead of the default 429 reply.
    pub on_rate_limited: Option<Arc<dyn AmmoStep>>,
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self {
            max_requests: 60,
            time_window_secs: 60,
            key_prefix: "rl:".to_string(),
            store: StoreChoice::Memory,
            algorithm: Algorithm::TokenBucket,
            token_bucket: TokenBucketConfig::default(),
            sliding_window: SlidingWindowConfig::default(),
            fixed_window: FixedWindowConfig::default(),
            header_format: HeaderFormat::default(),
            key_generator: None,
            on_rate_limited: None,
        }
    }
}

impl RateLimitOptions {
    fn validate(&self) -> TejasResult<()> {
        if self.max_requests == 0 {
            return Err(TejasError::Config(
                "maxRequests must be greater than 0".to_string(),
            ));
        }
        if self.time_window_secs == 0 {
            return Err(TejasError::Config(
                "timeWindowSeconds must be greater than 0".to_string(),
            ));
        }
        if self.sliding_window.granularity_ms == 0 {
            return Err(TejasError::Config(
                "sliding window granularity must be greater than 0".to_string(),
            ));
        }
        if let Some(burst) = self.token_bucket.burst_size {
            if burst == 0 {
                return Err(TejasError::Config(
                    "token bucket burst size must be greater than 0".to_string(),
                ));
            }
        }
        if let Some(rate) = self.token_bucket.refill_rate {
            if rate <= 0.0 {
                return Err(TejasError::Config(
                    "token bucket refill rate must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// One configured limiter over one storage backend.
pub struct RateLimiter {
    options: RateLimitOptions,
    store: Arc<dyn RateLimitStore>,
    /// Serializes the get-modify-set cycle; see the storage notes.
    gate: tokio::sync::Mutex<()>,
}

impl RateLimiter {
    pub fn new(options: RateLimitOptions) -> TejasResult<Self> {
        options.validate()?;
        let store: Arc<dyn RateLimitStore> = match &options.store {
            StoreChoice::Memory => Arc::new(MemoryStore::new()),
            StoreChoice::Redis(url) => Arc::new(RedisStore::new(url)?),
        };
        Ok(Self {
            options,
            store,
            gate: tokio::sync::Mutex::new(()),
        })
    }

    pub fn options(&self) -> &RateLimitOptions {
        &self.options
    }

    /// Checks and records one request for `identifier`.
    pub async fn consume(&self, identifier: &str) -> TejasResult<Verdict> {
        self.consume_at(identifier, now_ms()).await
    }

    pub(crate) async fn consume_at(&self, identifier: &str, now_ms: u64) -> TejasResult<Verdict> {
        let key = self.storage_key(identifier);
        let ttl = self.options.time_window_secs;

        let _guard = self.gate.lock().await;
        let stored = self.store.get(&key).await?;

        let verdict = match self.options.algorithm {
            Algorithm::TokenBucket => {
                let state = stored.and_then(|s| serde_json::from_str(&s).ok());
                let (next, verdict) = token_bucket::consume(state, &self.token_bucket_options(), now_ms);
                self.persist(&key, &next, ttl).await?;
                verdict
            }
            Algorithm::SlidingWindow => {
                let state = stored.and_then(|s| serde_json::from_str(&s).ok());
                let (next, verdict) =
                    sliding_window::consume(state, &self.sliding_window_options(), now_ms);
                self.persist(&key, &next, ttl).await?;
                verdict
            }
            Algorithm::FixedWindow => {
                let state = stored.and_then(|s| serde_json::from_str(&s).ok());
                let (next, verdict) =
                    fixed_window::consume(state, &self.fixed_window_options(), now_ms);
                self.persist(&key, &next, ttl).await?;
                verdict
            }
        };

        debug!(
            key = %key,
            allowed = verdict.allowed,
            remaining = verdict.remaining,
            "rate limit decision"
        );
        Ok(verdict)
    }

    /// Clears the record for `identifier`, restoring a fresh window.
    pub async fn reset(&self, identifier: &str) -> TejasResult<()> {
        let key = self.storage_key(identifier);
        self.store.delete(&key).await
    }

    /// Identifier for this request: the configured generator or the
    /// client IP.
    pub fn identifier(&self, ammo: &Ammo) -> Result<String, HttpError> {
        match &self.options.key_generator {
            Some(generator) => generator(ammo),
            None => Ok(ammo.ip().to_string()),
        }
    }

    fn storage_key(&self, identifier: &str) -> String {
        format!(
            "{}{}",
            self.options.key_prefix,
            KeyGenerator::sanitize_key(identifier)
        )
    }

    async fn persist<S: serde::Serialize>(&self, key: &str, state: &S, ttl: u64) -> TejasResult<()> {
        let text =
            serde_json::to_string(state).map_err(|e| TejasError::Storage(e.to_string()))?;
        self.store.set(key, &text, ttl).await
    }

    fn token_bucket_options(&self) -> TokenBucketOptions {
        let burst = self
            .options
            .token_bucket
            .burst_size
            .unwrap_or(self.options.max_requests);
        let rate = self.options.token_bucket.refill_rate.unwrap_or(
            self.options.max_requests as f64 / self.options.time_window_secs as f64,
        );
        TokenBucketOptions {
            burst_size: burst,
            refill_rate: rate,
        }
    }

    fn sliding_window_options(&self) -> SlidingWindowOptions {
        SlidingWindowOptions {
            max_requests: self.options.max_requests,
            window_secs: self.options.time_window_secs,
            granularity_ms: self.options.sliding_window.granularity_ms,
            weight_current: self.options.sliding_window.weight_current,
            weight_previous: self.options.sliding_window.weight_previous,
        }
    }

    fn fixed_window_options(&self) -> FixedWindowOptions {
        FixedWindowOptions {
            max_requests: self.options.max_requests,
            window_secs: self.options.time_window_secs,
            strict_window: self.options.fixed_window.strict_window,
        }
    }

    /// Stamps the decision headers onto the response channel.
    pub(crate) fn apply_headers(&self, responder: &Responder, verdict: &Verdict, now_secs: u64) {
        let format = &self.options.header_format;
        let limit = self.options.max_requests.to_string();
        let remaining = verdict.remaining.to_string();
        let reset = if format.draft8 {
            verdict.reset_at.saturating_sub(now_secs).to_string()
        } else {
            verdict.reset_at.to_string()
        };

        if matches!(format.kind, HeaderKind::Standard | HeaderKind::Both) {
            responder.set_header("RateLimit-Limit", limit.clone());
            responder.set_header("RateLimit-Remaining", remaining.clone());
            responder.set_header("RateLimit-Reset", reset.clone());
            if format.draft7 {
                responder.set_header(
                    "RateLimit-Policy",
                    format!("{};w={}", self.options.max_requests, self.options.time_window_secs),
                );
            }
        }
        if matches!(format.kind, HeaderKind::Legacy | HeaderKind::Both) {
            responder.set_header("X-RateLimit-Limit", limit);
            responder.set_header("X-RateLimit-Remaining", remaining);
            responder.set_header("X-RateLimit-Reset", reset);
        }
    }
}

/// Wraps a limiter as a chain step. Allowed requests continue with the
/// decision headers set; rejected requests get `Retry-After` and either the
/// configured hook or a plain 429.
pub fn rate_limit_middleware(limiter: Arc<RateLimiter>) -> Middleware {
    Middleware::ammo(move |ammo: Ammo| {
        let limiter = Arc::clone(&limiter);
        async move {
            let identifier = limiter.identifier(&ammo)?;
            let verdict = limiter
                .consume(&identifier)
                .await
                .map_err(HttpError::from)?;

            let now = now_secs();
            limiter.apply_headers(ammo.responder(), &verdict, now);
            if verdict.allowed {
                return Ok(Flow::Continue);
            }

            ammo.responder().set_header(
                "Retry-After",
                verdict.reset_at.saturating_sub(now).to_string(),
            );
            match &limiter.options().on_rate_limited {
                Some(hook) => {
                    hook.call(ammo.clone()).await?;
                }
                None => {
                    ammo.throw(HttpError::too_many_requests());
                }
            }
            Ok(Flow::Halt)
        }
    })
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn now_secs() -> u64 {
    now_ms() / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(options: RateLimitOptions) -> RateLimiter {
        RateLimiter::new(options).unwrap()
    }

    #[tokio::test]
    async fn test_fixed_window_scenario() {
        let rl = limiter(RateLimitOptions {
            max_requests: 3,
            time_window_secs: 60,
            algorithm: Algorithm::FixedWindow,
            ..Default::default()
        });

        let base = 1_000_000_000_000u64;
        let mut remaining = Vec::new();
        for i in 0..3 {
            let verdict = rl.consume_at("1.2.3.4", base + i * 3_000).await.unwrap();
            assert!(verdict.allowed);
            remaining.push(verdict.remaining);
        }
        assert_eq!(remaining, vec![2, 1, 0]);

        let verdict = rl.consume_at("1.2.3.4", base + 10_000).await.unwrap();
        assert!(!verdict.allowed);
        // Window anchored at the first hit: ~50s until reset.
        let retry_after = verdict.reset_at - (base + 10_000) / 1000;
        assert_eq!(retry_after, 50);
    }

    #[tokio::test]
    async fn test_token_bucket_scenario() {
        let rl = limiter(RateLimitOptions {
            max_requests: 60,
            time_window_secs: 60,
            algorithm: Algorithm::TokenBucket,
            token_bucket: TokenBucketConfig {
                burst_size: Some(5),
                refill_rate: Some(1.0),
            },
            ..Default::default()
        });

        let base = 1_700_000_000_000u64;
        for _ in 0..5 {
            assert!(rl.consume_at("ip", base).await.unwrap().allowed);
        }
        assert!(!rl.consume_at("ip", base).await.unwrap().allowed);

        let verdict = rl.consume_at("ip", base + 2_000).await.unwrap();
        assert!(verdict.allowed);
        assert_eq!(verdict.remaining, 1);
    }

    #[tokio::test]
    async fn test_sliding_window_through_store() {
        let rl = limiter(RateLimitOptions {
            max_requests: 2,
            time_window_secs: 10,
            algorithm: Algorithm::SlidingWindow,
            ..Default::default()
        });

        let base = 1_700_000_000_000u64;
        assert!(rl.consume_at("k", base).await.unwrap().allowed);
        assert!(rl.consume_at("k", base + 100).await.unwrap().allowed);
        assert!(!rl.consume_at("k", base + 200).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_verdict_invariants() {
        let rl = limiter(RateLimitOptions {
            max_requests: 4,
            algorithm: Algorithm::FixedWindow,
            ..Default::default()
        });
        let base = 1_700_000_000_000u64;
        for i in 0..6 {
            let verdict = rl.consume_at("inv", base + i * 10).await.unwrap();
            assert!(verdict.remaining <= 4);
            assert!(verdict.reset_at >= base / 1000);
        }
    }

    #[tokio::test]
    async fn test_reset_clears_record() {
        let rl = limiter(RateLimitOptions {
            max_requests: 1,
            algorithm: Algorithm::FixedWindow,
            ..Default::default()
        });
        let base = 1_700_000_000_000u64;
        assert!(rl.consume_at("r", base).await.unwrap().allowed);
        assert!(!rl.consume_at("r", base + 1).await.unwrap().allowed);
        rl.reset("r").await.unwrap();
        assert!(rl.consume_at("r", base + 2).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_identifiers_are_isolated() {
        let rl = limiter(RateLimitOptions {
            max_requests: 1,
            algorithm: Algorithm::FixedWindow,
            ..Default::default()
        });
        let base = 1_700_000_000_000u64;
        assert!(rl.consume_at("a", base).await.unwrap().allowed);
        assert!(rl.consume_at("b", base).await.unwrap().allowed);
        assert!(!rl.consume_at("a", base + 1).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_zero_limit_rejected_at_build() {
        assert!(RateLimiter::new(RateLimitOptions {
            max_requests: 0,
            ..Default::default()
        })
        .is_err());
        assert!(RateLimiter::new(RateLimitOptions {
            time_window_secs: 0,
            ..Default::default()
        })
        .is_err());
    }

    #[test]
    fn test_headers_standard_and_legacy() {
        let rl = limiter(RateLimitOptions {
            max_requests: 60,
            header_format: HeaderFormat {
                kind: HeaderKind::Both,
                draft7: true,
                draft8: false,
            },
            ..Default::default()
        });
        let responder = Responder::new();
        let verdict = Verdict::allowed(59, 1_700_000_060);
        rl.apply_headers(&responder, &verdict, 1_700_000_000);
        responder.send_text(200, "ok");
        let reply = responder.take_reply().unwrap();
        let names: Vec<&str> = reply.headers.iter().map(|(k, _)| k.as_str()).collect();
        assert!(names.contains(&"RateLimit-Limit"));
        assert!(names.contains(&"RateLimit-Policy"));
        assert!(names.contains(&"X-RateLimit-Reset"));
        let reset = reply
            .headers
            .iter()
            .find(|(k, _)| k == "RateLimit-Reset")
            .unwrap();
        assert_eq!(reset.1, "1700000060");
        let policy = reply
            .headers
            .iter()
            .find(|(k, _)| k == "RateLimit-Policy")
            .unwrap();
        assert_eq!(policy.1, "60;w=60");
    }

    #[test]
    fn test_headers_draft8_delta() {
        let rl = limiter(RateLimitOptions {
            header_format: HeaderFormat {
                kind: HeaderKind::Standard,
                draft7: false,
                draft8: true,
            },
            ..Default::default()
        });
        let responder = Responder::new();
        let verdict = Verdict::allowed(10, 1_700_000_045);
        rl.apply_headers(&responder, &verdict, 1_700_000_000);
        responder.send_text(200, "ok");
        let reply = responder.take_reply().unwrap();
        let reset = reply
            .headers
            .iter()
            .find(|(k, _)| k == "RateLimit-Reset")
            .unwrap();
        assert_eq!(reset.1, "45");
    }
}
