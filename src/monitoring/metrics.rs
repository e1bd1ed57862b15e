// src/monitoring/metrics.rs
//! Basic cache counters: hits, misses, sets, deletes and evictions.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic cache counters owned by a single cache instance
#[derive(Debug)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    evictions: AtomicU64,
    timestamps: Mutex<Timestamps>,
}

#[derive(Debug, Clone, Copy)]
struct Timestamps {
    start_time: DateTime<Utc>,
    last_reset: DateTime<Utc>,
}

/// Point-in-time copy of [`CacheMetrics`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub hit_rate: f64,
    pub start_time: DateTime<Utc>,
    pub last_reset: DateTime<Utc>,
    pub uptime_secs: i64,
}

impl MetricsSnapshot {
    pub fn lookups(&self) -> u64 {
        self.hits + self.misses
    }

    /// Get a human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "Cache: {:.1}% hit rate ({} hits / {} misses), {} sets, {} deletes, {} evictions",
            self.hit_rate * 100.0,
            self.hits,
            self.misses,
            self.sets,
            self.deletes,
            self.evictions
        )
    }
}

impl CacheMetrics {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            timestamps: Mutex::new(Timestamps {
                start_time: now,
                last_reset: now,
            }),
        }
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: u64) {
        if count > 0 {
            self.evictions.fetch_add(count, Ordering::Relaxed);
        }
    }

    /// Calculate cache hit rate
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn stats(&self) -> MetricsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let timestamps = *self.timestamps.lock();

        MetricsSnapshot {
            hits,
            misses,
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
            start_time: timestamps.start_time,
            last_reset: timestamps.last_reset,
            uptime_secs: (Utc::now() - timestamps.start_time).num_seconds(),
        }
    }

    /// Zero all counters and restart both timestamps
    pub fn reset(&self) {
        let mut timestamps = self.timestamps.lock();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.sets.store(0, Ordering::Relaxed);
        self.deletes.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        let now = Utc::now();
        timestamps.start_time = now;
        timestamps.last_reset = now;
    }
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}
