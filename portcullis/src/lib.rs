//! # portcullis
//!
//! A stateless, horizontally-scalable API gateway. Every instance runs the
//! same ordered request pipeline; coordination state (rate counters, circuit
//! state, violation counters, token blacklist) lives in a shared Redis, and
//! durable configuration (users, keys, routes, policies, IP rules, audit)
//! lives in PostgreSQL.
//!
//! ## Pipeline
//!
//! 1. Context — request id, client IP, start time
//! 2. Logger — structured request/response events
//! 3. IP rules — block list / allowlist enforcement
//! 4. Authentication — bearer token or API key
//! 5. Rate limit — five strategies, atomic in the shared cache
//! 6. Metrics — counters and latency histograms
//! 7. Proxy — circuit breaker, retries, upstream forwarding
//! 8. Response transform — security and gateway headers
//!
//! ## Example
//!
//! ```rust,no_run
//! use portcullis::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config);
//!
//!     let state = AppState::connect(config).await?;
//!     Server::new(state).serve().await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod autoblock;
pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod handlers;
pub mod health;
pub mod metrics;
pub mod middleware;
pub mod model;
pub mod observability;
pub mod proxy;
pub mod ratelimit;
pub mod repository;
pub mod routing;
pub mod server;
pub mod state;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, ErrorCode, Result};
    pub use crate::observability::init_tracing;
    pub use crate::server::Server;
    pub use crate::state::AppState;
}
