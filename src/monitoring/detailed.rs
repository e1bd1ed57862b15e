// src/monitoring/detailed.rs
//! Detailed cache metrics collection
//!
//! On top of the basic counters this tracks:
//! - Rolling latency windows per operation with p50/p95/p99
//! - Current and peak byte usage, allocation and deallocation counts
//! - Per-key access frequency and hourly hit counts
//! - Value type distribution and a size-bucket histogram
//! - Operations over the slow threshold and items over the large threshold

use super::health::{self, HealthInputs, HealthReport};
use super::metrics::{CacheMetrics, MetricsSnapshot};
use crate::context::Context;
use chrono::{Timelike, Utc};
use dashmap::DashMap;
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Upper bounds (exclusive) of the size histogram buckets; the last bucket is open
const SIZE_BUCKETS: [(usize, &str); 4] = [
    (1024, "<1KB"),
    (10 * 1024, "1KB-10KB"),
    (100 * 1024, "10KB-100KB"),
    (1024 * 1024, "100KB-1MB"),
];
const SIZE_BUCKET_OVERFLOW: &str = ">=1MB";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Samples kept per operation for percentile calculation
    pub window_size: usize,
    pub slow_threshold: Duration,
    pub large_item_threshold: usize,
    /// How many keys `top_keys` reports in snapshots
    pub top_keys: usize,
    /// Most keys whose access counts are kept at once
    pub max_tracked_keys: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            window_size: 1000,
            slow_threshold: Duration::from_millis(100),
            large_item_threshold: 1024 * 1024,
            top_keys: 10,
            max_tracked_keys: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Get,
    Set,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Get => "get",
            Operation::Set => "set",
            Operation::Delete => "delete",
        }
    }
}

/// Latency tracking with percentile calculations
#[derive(Debug)]
struct LatencyTracker {
    samples: VecDeque<Duration>,
    max_samples: usize,
}

impl LatencyTracker {
    fn new(max_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples.min(4096)),
            max_samples: max_samples.max(1),
        }
    }

    fn record(&mut self, latency: Duration) {
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(latency);
    }

    fn summary(&self) -> LatencySummary {
        if self.samples.is_empty() {
            return LatencySummary::default();
        }

        let mut sorted: Vec<_> = self.samples.iter().cloned().collect();
        sorted.sort();

        let percentile = |p: f64| {
            let index = ((sorted.len() as f64 - 1.0) * p / 100.0) as usize;
            sorted[index.min(sorted.len() - 1)]
        };
        let total: Duration = sorted.iter().sum();

        LatencySummary {
            samples: sorted.len(),
            avg: total / sorted.len() as u32,
            p50: percentile(50.0),
            p95: percentile(95.0),
            p99: percentile(99.0),
            max: sorted[sorted.len() - 1],
        }
    }

    fn clear(&mut self) {
        self.samples.clear();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub samples: usize,
    pub avg: Duration,
    pub p50: Duration,
    pub p95: Duration,
    pub p99: Duration,
    pub max: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemorySummary {
    pub current_bytes: u64,
    pub peak_bytes: u64,
    pub allocations: u64,
    pub deallocations: u64,
}

/// Everything the detailed collector knows, at one instant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailedSnapshot {
    pub basic: MetricsSnapshot,
    pub latency: HashMap<Operation, LatencySummary>,
    pub memory: MemorySummary,
    pub top_keys: Vec<(String, u64)>,
    pub hourly_hits: Vec<u64>,
    pub value_types: HashMap<String, u64>,
    pub size_histogram: Vec<(String, u64)>,
    pub slow_operations: u64,
    pub large_items: u64,
    pub errors: u64,
}

pub struct DetailedCacheMetrics {
    basic: CacheMetrics,
    config: MetricsConfig,
    get_latency: Mutex<LatencyTracker>,
    set_latency: Mutex<LatencyTracker>,
    delete_latency: Mutex<LatencyTracker>,
    current_bytes: AtomicU64,
    peak_bytes: AtomicU64,
    allocations: AtomicU64,
    deallocations: AtomicU64,
    key_access: DashMap<String, u64>,
    hourly_hits: [AtomicU64; 24],
    value_types: DashMap<String, u64>,
    size_buckets: [AtomicU64; SIZE_BUCKETS.len() + 1],
    slow_operations: AtomicU64,
    large_items: AtomicU64,
    errors: AtomicU64,
}

impl DetailedCacheMetrics {
    pub fn new(config: MetricsConfig) -> Self {
        let window = config.window_size;
        Self {
            basic: CacheMetrics::new(),
            get_latency: Mutex::new(LatencyTracker::new(window)),
            set_latency: Mutex::new(LatencyTracker::new(window)),
            delete_latency: Mutex::new(LatencyTracker::new(window)),
            config,
            current_bytes: AtomicU64::new(0),
            peak_bytes: AtomicU64::new(0),
            allocations: AtomicU64::new(0),
            deallocations: AtomicU64::new(0),
            key_access: DashMap::new(),
            hourly_hits: std::array::from_fn(|_| AtomicU64::new(0)),
            value_types: DashMap::new(),
            size_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            slow_operations: AtomicU64::new(0),
            large_items: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    pub fn basic(&self) -> &CacheMetrics {
        &self.basic
    }

    fn tracker(&self, op: Operation) -> &Mutex<LatencyTracker> {
        match op {
            Operation::Get => &self.get_latency,
            Operation::Set => &self.set_latency,
            Operation::Delete => &self.delete_latency,
        }
    }

    /// Record how long an operation took; returns true if it counted as slow
    pub fn record_latency(&self, op: Operation, latency: Duration) -> bool {
        self.tracker(op).lock().record(latency);
        if latency > self.config.slow_threshold {
            self.slow_operations.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        false
    }

    fn record_access(&self, key: &str) {
        // get_mut first so hot keys do not allocate a String per hit
        if let Some(mut count) = self.key_access.get_mut(key) {
            *count += 1;
            return;
        }
        if self.key_access.len() >= self.config.max_tracked_keys {
            self.prune_key_access();
        }
        *self.key_access.entry(key.to_string()).or_insert(0) += 1;
    }

    /// Drop the least accessed half of the tracked keys
    fn prune_key_access(&self) {
        let mut counts: Vec<(String, u64)> = self
            .key_access
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        if counts.len() < self.config.max_tracked_keys {
            return;
        }
        counts.sort_unstable_by_key(|(_, count)| *count);
        let excess = counts.len() - self.config.max_tracked_keys / 2;
        for (key, _) in counts.into_iter().take(excess) {
            self.key_access.remove(&key);
        }
        debug!(
            "Key access map pruned to {} of at most {} keys",
            self.key_access.len(),
            self.config.max_tracked_keys
        );
    }

    /// Number of keys with a tracked access count
    pub fn tracked_keys(&self) -> usize {
        self.key_access.len()
    }

    pub fn record_hit(&self, key: &str, latency: Duration) {
        self.basic.record_hit();
        self.record_access(key);
        let hour = Utc::now().hour() as usize;
        self.hourly_hits[hour % 24].fetch_add(1, Ordering::Relaxed);
        self.record_latency(Operation::Get, latency);
    }

    pub fn record_miss(&self, key: &str, latency: Duration) {
        self.basic.record_miss();
        self.record_access(key);
        self.record_latency(Operation::Get, latency);
    }

    /// Record a stored value of `size` bytes, replacing `replaced` bytes if it overwrote one
    pub fn record_set(
        &self,
        key: &str,
        value_type: &str,
        size: usize,
        replaced: Option<usize>,
        latency: Duration,
    ) {
        self.basic.record_set();
        if let Some(old) = replaced {
            self.deallocate(old as u64);
        }
        self.allocate(size as u64);

        *self.value_types.entry(value_type.to_string()).or_insert(0) += 1;

        let bucket = SIZE_BUCKETS
            .iter()
            .position(|(bound, _)| size < *bound)
            .unwrap_or(SIZE_BUCKETS.len());
        self.size_buckets[bucket].fetch_add(1, Ordering::Relaxed);

        if size > self.config.large_item_threshold {
            self.large_items.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Large cache item '{}': {} bytes (threshold {} bytes)",
                key, size, self.config.large_item_threshold
            );
        }

        self.record_latency(Operation::Set, latency);
    }

    pub fn record_delete(&self, freed: Option<usize>, latency: Duration) {
        if let Some(bytes) = freed {
            self.basic.record_delete();
            self.deallocate(bytes as u64);
        }
        self.record_latency(Operation::Delete, latency);
    }

    /// Entries dropped by eviction or expiry sweeps
    pub fn record_evictions(&self, count: usize, bytes: usize) {
        if count == 0 {
            return;
        }
        self.basic.record_evictions(count as u64);
        self.deallocations.fetch_add(count as u64 - 1, Ordering::Relaxed);
        self.deallocate(bytes as u64);
    }

    /// Entries dropped in bulk without counting as evictions (clear)
    pub fn record_cleared(&self, count: usize, bytes: usize) {
        if count == 0 {
            return;
        }
        self.deallocations.fetch_add(count as u64 - 1, Ordering::Relaxed);
        self.deallocate(bytes as u64);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn allocate(&self, bytes: u64) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        let now = self.current_bytes.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.peak_bytes.fetch_max(now, Ordering::Relaxed);
    }

    fn deallocate(&self, bytes: u64) {
        self.deallocations.fetch_add(1, Ordering::Relaxed);
        // Saturate: a reset between allocate and deallocate must not wrap.
        let _ = self
            .current_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| Some(cur.saturating_sub(bytes)));
    }

    /// Align the byte gauge with what the store actually holds.
    ///
    /// Lazy expiry on read frees bytes without going through the collector.
    pub fn sync_current_bytes(&self, bytes: usize) {
        self.current_bytes.store(bytes as u64, Ordering::Relaxed);
    }

    pub fn latency(&self, op: Operation) -> LatencySummary {
        self.tracker(op).lock().summary()
    }

    pub fn memory(&self) -> MemorySummary {
        MemorySummary {
            current_bytes: self.current_bytes.load(Ordering::Relaxed),
            peak_bytes: self.peak_bytes.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
            deallocations: self.deallocations.load(Ordering::Relaxed),
        }
    }

    /// The `n` most accessed keys, most frequent first
    pub fn top_keys(&self, n: usize) -> Vec<(String, u64)> {
        let mut keys: Vec<(String, u64)> = self
            .key_access
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        keys.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        keys.truncate(n);
        keys
    }

    pub fn slow_operations(&self) -> u64 {
        self.slow_operations.load(Ordering::Relaxed)
    }

    pub fn large_items(&self) -> u64 {
        self.large_items.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> DetailedSnapshot {
        let latency = [Operation::Get, Operation::Set, Operation::Delete]
            .into_iter()
            .map(|op| (op, self.latency(op)))
            .collect();

        let size_histogram = SIZE_BUCKETS
            .iter()
            .map(|(_, label)| *label)
            .chain(std::iter::once(SIZE_BUCKET_OVERFLOW))
            .zip(self.size_buckets.iter())
            .map(|(label, count)| (label.to_string(), count.load(Ordering::Relaxed)))
            .collect();

        DetailedSnapshot {
            basic: self.basic.stats(),
            latency,
            memory: self.memory(),
            top_keys: self.top_keys(self.config.top_keys),
            hourly_hits: self.hourly_hits.iter().map(|h| h.load(Ordering::Relaxed)).collect(),
            value_types: self
                .value_types
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
            size_histogram,
            slow_operations: self.slow_operations(),
            large_items: self.large_items(),
            errors: self.errors(),
        }
    }

    /// Classify health against a store budget of `max_bytes`
    pub fn health(&self, max_bytes: usize) -> HealthReport {
        let basic = self.basic.stats();
        health::evaluate(HealthInputs {
            hits: basic.hits,
            misses: basic.misses,
            current_bytes: self.current_bytes.load(Ordering::Relaxed),
            max_bytes: max_bytes as u64,
            errors: self.errors(),
            slow_operations: self.slow_operations(),
        })
    }

    /// Zero counters, windows and distributions.
    ///
    /// `current_bytes` is left alone: it mirrors what the store still holds.
    pub fn reset(&self) {
        self.basic.reset();
        self.get_latency.lock().clear();
        self.set_latency.lock().clear();
        self.delete_latency.lock().clear();
        self.peak_bytes
            .store(self.current_bytes.load(Ordering::Relaxed), Ordering::Relaxed);
        self.allocations.store(0, Ordering::Relaxed);
        self.deallocations.store(0, Ordering::Relaxed);
        self.key_access.clear();
        for hour in &self.hourly_hits {
            hour.store(0, Ordering::Relaxed);
        }
        self.value_types.clear();
        for bucket in &self.size_buckets {
            bucket.store(0, Ordering::Relaxed);
        }
        self.slow_operations.store(0, Ordering::Relaxed);
        self.large_items.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
    }

    /// Hand a full snapshot to `callback` every `every` until `ctx` ends
    pub fn start_periodic_reporting<F>(
        self: &Arc<Self>,
        ctx: Context,
        every: Duration,
        mut callback: F,
    ) -> JoinHandle<()>
    where
        F: FnMut(DetailedSnapshot) + Send + 'static,
    {
        let metrics = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately; report only after a full interval.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ctx.done() => {
                        debug!("Periodic metrics reporting stopped");
                        break;
                    }
                    _ = ticker.tick() => callback(metrics.snapshot()),
                }
            }
        })
    }
}

impl Default for DetailedCacheMetrics {
    fn default() -> Self {
        Self::new(MetricsConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_latency_percentiles() {
        let metrics = DetailedCacheMetrics::default();
        for i in 1..=100 {
            metrics.record_latency(Operation::Get, Duration::from_micros(i));
        }
        let summary = metrics.latency(Operation::Get);
        assert_eq!(summary.samples, 100);
        assert_eq!(summary.p50, Duration::from_micros(50));
        assert_eq!(summary.p95, Duration::from_micros(95));
        assert_eq!(summary.p99, Duration::from_micros(99));
        assert_eq!(summary.max, Duration::from_micros(100));
        assert_eq!(metrics.latency(Operation::Set).samples, 0);
    }

    #[test]
    fn test_latency_window_is_bounded() {
        let metrics = DetailedCacheMetrics::new(MetricsConfig {
            window_size: 10,
            ..MetricsConfig::default()
        });
        for i in 0..50 {
            metrics.record_latency(Operation::Set, Duration::from_micros(i));
        }
        let summary = metrics.latency(Operation::Set);
        assert_eq!(summary.samples, 10);
        // Only the newest samples (40..50) remain.
        assert_eq!(summary.p50, Duration::from_micros(44));
    }

    #[test]
    fn test_key_tracking_stays_bounded_and_keeps_hot_keys() {
        let metrics = DetailedCacheMetrics::new(MetricsConfig {
            max_tracked_keys: 100,
            ..MetricsConfig::default()
        });
        for _ in 0..5 {
            metrics.record_hit("hot", ms(0));
        }
        for i in 0..50_000 {
            metrics.record_miss(&format!("cold-{i}"), ms(0));
            assert!(metrics.tracked_keys() <= 100);
        }

        assert_eq!(metrics.top_keys(1), vec![("hot".to_string(), 5)]);
        assert!(metrics.top_keys(usize::MAX).len() <= 100);
        assert_eq!(metrics.basic().stats().misses, 50_000);
    }

    #[test]
    fn test_slow_and_large_thresholds() {
        let metrics = DetailedCacheMetrics::new(MetricsConfig {
            slow_threshold: ms(10),
            large_item_threshold: 100,
            ..MetricsConfig::default()
        });
        assert!(!metrics.record_latency(Operation::Get, ms(1)));
        assert!(metrics.record_latency(Operation::Get, ms(20)));
        metrics.record_set("big", "String", 500, None, ms(1));
        metrics.record_set("small", "String", 50, None, ms(1));

        assert_eq!(metrics.slow_operations(), 1);
        assert_eq!(metrics.large_items(), 1);
    }

    #[test]
    fn test_memory_accounting() {
        let metrics = DetailedCacheMetrics::default();
        metrics.record_set("a", "String", 100, None, ms(0));
        metrics.record_set("b", "String", 300, None, ms(0));
        metrics.record_set("a", "String", 50, Some(100), ms(0));
        metrics.record_delete(Some(300), ms(0));
        metrics.record_evictions(1, 50);

        let memory = metrics.memory();
        assert_eq!(memory.current_bytes, 0);
        assert_eq!(memory.peak_bytes, 400);
        assert_eq!(memory.allocations, 3);
        assert_eq!(memory.deallocations, 3);
        assert_eq!(metrics.basic().stats().evictions, 1);
        assert_eq!(metrics.basic().stats().deletes, 1);
    }

    #[test]
    fn test_key_frequency_and_distributions() {
        let metrics = DetailedCacheMetrics::default();
        for _ in 0..3 {
            metrics.record_hit("hot", ms(0));
        }
        metrics.record_miss("cold", ms(0));
        metrics.record_hit("warm", ms(0));
        metrics.record_hit("warm", ms(0));
        metrics.record_set("hot", "serde_json::Value", 2048, None, ms(0));
        metrics.record_set("cold", "String", 10, None, ms(0));

        assert_eq!(
            metrics.top_keys(2),
            vec![("hot".to_string(), 3), ("warm".to_string(), 2)]
        );

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.hourly_hits.iter().sum::<u64>(), 5);
        assert_eq!(snapshot.value_types.get("String"), Some(&1));
        assert_eq!(snapshot.size_histogram[0], ("<1KB".to_string(), 1));
        assert_eq!(snapshot.size_histogram[1], ("1KB-10KB".to_string(), 1));
        assert_eq!(snapshot.size_histogram.len(), 5);
    }

    #[test]
    fn test_health_uses_recorded_state() {
        let metrics = DetailedCacheMetrics::default();
        metrics.record_set("k", "String", 960, None, ms(0));
        metrics.record_hit("k", ms(0));
        let report = metrics.health(1000);
        assert_eq!(report.status, health::HealthStatus::Critical);

        metrics.record_error();
        assert!(metrics.health(10_000).warnings.iter().any(|w| w.contains("errors")));
    }

    #[test]
    fn test_reset_keeps_current_bytes() {
        let metrics = DetailedCacheMetrics::default();
        metrics.record_set("k", "String", 128, None, ms(0));
        metrics.record_hit("k", ms(0));
        metrics.reset();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.basic.hits, 0);
        assert_eq!(snapshot.memory.current_bytes, 128);
        assert!(snapshot.top_keys.is_empty());
        assert_eq!(snapshot.latency[&Operation::Get].samples, 0);
    }

    #[tokio::test]
    async fn test_periodic_reporting_until_cancelled() {
        let metrics = Arc::new(DetailedCacheMetrics::default());
        let reports = Arc::new(AtomicUsize::new(0));
        let ctx = Context::background();

        let counter = reports.clone();
        let handle = metrics.start_periodic_reporting(ctx.clone(), ms(20), move |_snapshot| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(ms(110)).await;
        ctx.cancel();
        handle.await.unwrap();

        let seen = reports.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected several reports, got {seen}");
        tokio::time::sleep(ms(50)).await;
        assert_eq!(reports.load(Ordering::SeqCst), seen);
    }
}
