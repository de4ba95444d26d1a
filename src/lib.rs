//! Ratemesh is a distributed, approximate sliding-window rate limiter that
//! lives inside your application processes.
//!
//! Each instance answers "may this request identified by key K proceed now?"
//! from in-process state only, within microseconds, then asynchronously
//! gossips accepted-request events to peer instances over a shared message
//! stream (Redis Streams by default). Peers fold received events into their
//! local per-key windows so that, in steady state, every instance converges
//! on approximately the same view of the request distribution per key.
//!
//! This is approximate limiting, not a distributed semaphore: local decisions
//! are authoritative for the caller, remote convergence is best-effort, and a
//! partitioned instance falls back to its local-only view.
//!
//! # Quick start
//!
//! ```rust
//! use ratemesh::{RateLimiter, RateLimiterOptions};
//!
//! let limiter = RateLimiter::new(RateLimiterOptions::default()).unwrap();
//!
//! if limiter.try_accept("user:123") {
//!     // proceed
//! } else {
//!     // deny, e.g. with HTTP 429
//! }
//! ```
//!
//! # Distributed setup
//!
//! ```no_run
//! # #[cfg(feature = "redis-broker")]
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//! use ratemesh::{
//!     MessageBroker, RateLimiter, RateLimiterOptions, RedisStreamBroker,
//!     RedisStreamBrokerOptions, WindowKind,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! let client = redis::Client::open("redis://127.0.0.1:6379")?;
//! let broker: Arc<dyn MessageBroker> = Arc::new(RedisStreamBroker::new(
//!     client,
//!     RedisStreamBrokerOptions::default(),
//! ));
//!
//! let limiter = RateLimiter::new(RateLimiterOptions {
//!     window_kind: WindowKind::Heap,
//!     broker: Some(broker),
//!     ..RateLimiterOptions::default()
//! })?;
//!
//! let cancel = CancellationToken::new();
//! limiter.start(cancel.clone());
//!
//! let allowed = limiter.try_accept("user:123");
//! # let _ = allowed;
//! # Ok(())
//! # }
//! # fn main() {}
//! ```

mod broker;
pub use broker::*;

mod clock;
pub use clock::*;

mod common;
pub use common::*;

mod error;
pub use error::*;

mod event;
pub use event::*;

mod middleware;
pub use middleware::*;

mod rate_limiter;
pub use rate_limiter::*;

mod window;
pub use window::*;

mod window_cache;
pub use window_cache::*;

#[cfg(test)]
mod tests;
