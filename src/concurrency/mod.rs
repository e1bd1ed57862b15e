//! Concurrency primitives for throttling upstream access.
//!
//! Each primitive owns its own synchronized state; `ConcurrencyManager`
//! composes them without a shared lock.

pub mod manager;
pub mod rate_limiter;
pub mod semaphore;
pub mod worker_pool;

pub use manager::{ConcurrencyConfig, ConcurrencyManager};
pub use rate_limiter::RateLimiter;
pub use semaphore::{SemaphoreLimiter, SlotGuard};
pub use worker_pool::{PoolStats, WorkerPool};
