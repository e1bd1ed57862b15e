// src/monitoring/health.rs
//! Health classification for a cache instance.
//!
//! Thresholds:
//! - hit rate below 50% is a warning, below 20% degrades the status
//! - memory usage above 80% is a warning, above 95% is critical
//! - any recorded error or slow operation is surfaced as a warning
//!
//! Hit-rate rules only apply once the cache has served at least one lookup,
//! so a freshly started cache reports healthy.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const HIT_RATE_WARNING: f64 = 0.5;
pub const HIT_RATE_DEGRADED: f64 = 0.2;
pub const MEMORY_WARNING: f64 = 0.8;
pub const MEMORY_CRITICAL: f64 = 0.95;

/// Overall cache health, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "HEALTHY",
            HealthStatus::Degraded => "DEGRADED",
            HealthStatus::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs the classifier looks at
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthInputs {
    pub hits: u64,
    pub misses: u64,
    pub current_bytes: u64,
    pub max_bytes: u64,
    pub errors: u64,
    pub slow_operations: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub hit_rate: f64,
    /// Fraction of the byte budget in use, 0.0 to 1.0
    pub memory_usage: f64,
    pub warnings: Vec<String>,
    pub summary: String,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

pub fn evaluate(inputs: HealthInputs) -> HealthReport {
    let mut status = HealthStatus::Healthy;
    let mut warnings = Vec::new();

    let lookups = inputs.hits + inputs.misses;
    let hit_rate = if lookups == 0 {
        0.0
    } else {
        inputs.hits as f64 / lookups as f64
    };

    if lookups > 0 {
        if hit_rate < HIT_RATE_DEGRADED {
            status = status.max(HealthStatus::Degraded);
            warnings.push(format!("Very low hit rate: {:.1}%", hit_rate * 100.0));
        } else if hit_rate < HIT_RATE_WARNING {
            warnings.push(format!("Low hit rate: {:.1}%", hit_rate * 100.0));
        }
    }

    let memory_usage = if inputs.max_bytes == 0 {
        0.0
    } else {
        inputs.current_bytes as f64 / inputs.max_bytes as f64
    };

    if memory_usage > MEMORY_CRITICAL {
        status = status.max(HealthStatus::Critical);
        warnings.push(format!("Memory usage critical: {:.1}%", memory_usage * 100.0));
    } else if memory_usage > MEMORY_WARNING {
        warnings.push(format!("High memory usage: {:.1}%", memory_usage * 100.0));
    }

    if inputs.errors > 0 {
        warnings.push(format!("{} errors recorded", inputs.errors));
    }
    if inputs.slow_operations > 0 {
        warnings.push(format!("{} slow operations recorded", inputs.slow_operations));
    }

    let summary = if warnings.is_empty() {
        format!(
            "{}: hit rate {:.1}%, memory {:.1}%",
            status,
            hit_rate * 100.0,
            memory_usage * 100.0
        )
    } else {
        format!("{}: {}", status, warnings.join("; "))
    };

    HealthReport {
        status,
        hit_rate,
        memory_usage,
        warnings,
        summary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(hits: u64, misses: u64, current: u64, max: u64) -> HealthInputs {
        HealthInputs {
            hits,
            misses,
            current_bytes: current,
            max_bytes: max,
            ..HealthInputs::default()
        }
    }

    #[test]
    fn test_fresh_cache_is_healthy() {
        let report = evaluate(inputs(0, 0, 0, 1024));
        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.warnings.is_empty());
        assert!(report.is_healthy());
    }

    #[test]
    fn test_hit_rate_thresholds() {
        let warn = evaluate(inputs(40, 60, 0, 1024));
        assert_eq!(warn.status, HealthStatus::Healthy);
        assert_eq!(warn.warnings.len(), 1);

        let degraded = evaluate(inputs(10, 90, 0, 1024));
        assert_eq!(degraded.status, HealthStatus::Degraded);
    }

    #[test]
    fn test_memory_thresholds() {
        let warn = evaluate(inputs(9, 1, 850, 1000));
        assert_eq!(warn.status, HealthStatus::Healthy);
        assert!(warn.warnings[0].contains("High memory usage"));

        let critical = evaluate(inputs(9, 1, 960, 1000));
        assert_eq!(critical.status, HealthStatus::Critical);

        // Critical memory outranks a degraded hit rate.
        let both = evaluate(inputs(1, 9, 990, 1000));
        assert_eq!(both.status, HealthStatus::Critical);
        assert_eq!(both.warnings.len(), 2);
    }

    #[test]
    fn test_errors_and_slow_operations_warn() {
        let report = evaluate(HealthInputs {
            hits: 10,
            max_bytes: 100,
            errors: 2,
            slow_operations: 1,
            ..HealthInputs::default()
        });
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.warnings.len(), 2);
        assert!(report.summary.starts_with("HEALTHY"));
    }
}
