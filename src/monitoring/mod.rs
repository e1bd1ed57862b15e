//! Monitoring Module
//!
//! Cache observability:
//! - Basic hit/miss/set/delete/eviction counters
//! - Detailed latency, memory and access-pattern metrics
//! - Health classification and periodic reporting

pub mod detailed;
pub mod health;
pub mod metrics;

pub use detailed::{
    DetailedCacheMetrics, DetailedSnapshot, LatencySummary, MemorySummary, MetricsConfig,
    Operation,
};
pub use health::{HealthReport, HealthStatus};
pub use metrics::{CacheMetrics, MetricsSnapshot};
