//! Gatelimit - Fixed-Window Request Rate Limiting
//!
//! This crate implements a request-admission gate for tower and axum
//! services. Hits are counted per identity key (client address by default)
//! within a fixed time window; once the quota is exceeded, requests are
//! rejected with a configurable status code until the window resets.
//!
//! Counting is delegated to a [`store::CounterStore`]: the process-local
//! [`store::InMemoryStore`] for single instances, or [`store::RedisStore`]
//! when several instances must share quotas. The admission verdict itself is
//! a pure function in [`policy`], and [`middleware::RateLimitLayer`] wires
//! both into the request pipeline.
//!
//! ```no_run
//! use std::time::Duration;
//! use axum::{routing::get, Router};
//! use gatelimit::{RateLimitConfig, RateLimitLayer};
//!
//! # fn build() -> gatelimit::Result<Router> {
//! let config = RateLimitConfig::builder()
//!     .window(Duration::from_secs(60))
//!     .max_hits(100)
//!     .build()?;
//!
//! let app = Router::new()
//!     .route("/", get(|| async { "hello" }))
//!     .layer(RateLimitLayer::new(config));
//! # Ok(app)
//! # }
//! ```

pub mod config;
pub mod error;
pub mod middleware;
pub mod policy;
pub mod store;

pub use config::{RateLimitConfig, RateLimitConfigBuilder};
pub use error::{GatelimitError, Result};
pub use middleware::{RateLimitLayer, RateLimitService};
pub use policy::{evaluate, Decision};
pub use store::{CounterStore, InMemoryStore, RedisStore, WindowRecord};
