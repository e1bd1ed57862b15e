//! Timing utilities for cache operations
//!
//! [`OpTimer`] measures a single cache operation and reports slow ones
//! against a threshold. [`Stopwatch`] times arbitrary named work with
//! optional checkpoints, used by the driver binary.

use crate::monitoring::detailed::Operation;
use log::{debug, info, warn};
use std::time::{Duration, Instant};

/// Times one cache operation on one key
#[derive(Debug)]
pub struct OpTimer {
    op: Operation,
    started: Instant,
}

impl OpTimer {
    pub fn start(op: Operation) -> Self {
        Self {
            op,
            started: Instant::now(),
        }
    }

    pub fn op(&self) -> Operation {
        self.op
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Stop the timer, warning if the operation on `key` exceeded `threshold`
    pub fn finish(self, key: &str, threshold: Duration) -> Duration {
        let elapsed = self.started.elapsed();
        if elapsed > threshold {
            warn!(
                "⚠️ Slow cache {} on '{}': {:.2}ms (threshold {}ms)",
                self.op.as_str(),
                key,
                elapsed.as_secs_f64() * 1000.0,
                threshold.as_millis()
            );
        }
        elapsed
    }
}

/// A named timer with checkpoints
#[derive(Debug)]
pub struct Stopwatch {
    start_time: Instant,
    operation_name: String,
    checkpoints: Vec<(String, Instant)>,
}

impl Stopwatch {
    pub fn start(operation_name: &str) -> Self {
        debug!("⏱️ Starting timer for: {}", operation_name);
        Self {
            start_time: Instant::now(),
            operation_name: operation_name.to_string(),
            checkpoints: Vec::new(),
        }
    }

    /// Add a checkpoint to track intermediate timing
    pub fn checkpoint(&mut self, checkpoint_name: &str) {
        let now = Instant::now();
        debug!(
            "📍 {} - {}: {}ms",
            self.operation_name,
            checkpoint_name,
            now.duration_since(self.start_time).as_millis()
        );
        self.checkpoints.push((checkpoint_name.to_string(), now));
    }

    /// Finish the timer and log the total duration with each segment
    pub fn finish(self) -> Duration {
        let total = self.start_time.elapsed();
        info!("🕐 {} completed in {}ms", self.operation_name, total.as_millis());

        let mut last = self.start_time;
        for (name, at) in &self.checkpoints {
            info!("   └─ {}: {}ms", name, at.duration_since(last).as_millis());
            last = *at;
        }
        total
    }
}
