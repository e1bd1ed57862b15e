//! In-process shield for expensive, rate-limited upstream calls.
//!
//! A bounded TTL cache with request coalescing sits in front of the
//! upstream, and a set of concurrency primitives (semaphore, worker pool,
//! token bucket) throttles the calls that do get through.

pub mod cache;
pub mod concurrency;
pub mod config;
pub mod context;
pub mod error;
pub mod monitoring;
pub mod utils;

pub use cache::{generate_key, BoundedStore, CacheConfig, CacheManager, CacheStats, EstimateSize, Upstream};
pub use concurrency::{
    ConcurrencyConfig, ConcurrencyManager, PoolStats, RateLimiter, SemaphoreLimiter, WorkerPool,
};
pub use context::Context;
pub use error::{ErrorCategory, ShieldError};
pub use monitoring::{DetailedCacheMetrics, HealthReport, HealthStatus, MetricsConfig};
