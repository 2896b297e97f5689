//! Process-local resilience primitives shared by the intake pipeline:
//! retrying executor with circuit breaker and deduplication, sliding-window
//! rate limiter, and a bounded TTL cache.
//!
//! All state here is safely discarded on restart; the work-item status column
//! is the durable source of truth.

pub mod cache;
pub mod executor;
pub mod rate_limiter;

pub use cache::BoundedCache;
pub use executor::{ExecuteOptions, ExecutorConfig, ResilientExecutor};
pub use rate_limiter::RateLimiter;
