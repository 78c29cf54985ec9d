//! # tejas
//!
//! A minimal backend HTTP framework: method-agnostic routing with
//! parameterized paths, an ordered middleware chain with send-once
//! semantics, a pluggable rate limiter (token bucket, sliding window, fixed
//! window over memory or Redis), a byte-bounded namespaced LRU cache, and
//! managed Redis/Mongo connections.
//!
//! ```rust,no_run
//! use serde_json::json;
//! use tejas::{Ammo, Endpoint, Flow, StepResult, Target, Tejas};
//!
//! async fn get_user(ammo: Ammo) -> StepResult {
//!     let id = ammo.field("id").unwrap_or_default();
//!     ammo.send(json!({ "id": id }));
//!     Ok(Flow::Halt)
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tejas::TejasError> {
//!     let mut app = Tejas::new()?;
//!     app.board(
//!         Target::new("/users")?
//!             .endpoint(Endpoint::new("/:id", get_user)?),
//!     )?;
//!     app.takeoff().await
//! }
//! ```

pub mod algorithms;
pub mod ammo;
pub mod app;
pub mod body;
pub mod cache;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod dispatch;
pub mod error;
pub mod key_generator;
pub mod lru;
pub mod middleware;
pub mod rate_limiter;
pub mod router;
mod server;
pub mod status;
pub mod store;

pub use algorithms::{Algorithm, Verdict};
pub use ammo::{Ammo, Reply, RequestInfo, Responder};
pub use app::Tejas;
pub use cache::{CacheStats, CacheStore};
pub use config::{Config, ConfigError};
pub use connection::{ConnectionKind, ConnectionManager, ConnectionSettings};
pub use error::{HttpError, TejasError, TejasResult};
pub use key_generator::{KeyGenerator, KeyStrategy};
pub use middleware::{Flow, Handler, Middleware, StepResult};
pub use rate_limiter::{
    rate_limit_middleware, HeaderFormat, HeaderKind, RateLimitOptions, RateLimiter, StoreChoice,
};
pub use router::{Endpoint, Registry, Target};
