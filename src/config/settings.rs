use crate::cache::manager::CacheConfig;
use crate::concurrency::manager::ConcurrencyConfig;
use crate::error::ShieldError;
use crate::monitoring::detailed::MetricsConfig;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub cache: CacheConfig,
    pub concurrency: ConcurrencyConfig,
    pub log_level: String,
}

/// Read `key`, falling back to `default` when unset or unparsable
fn var_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            log::warn!("Ignoring unparsable {}={:?}, using default", key, raw);
            default
        }),
        Err(_) => default,
    }
}

fn millis_or(key: &str, default: Duration) -> Duration {
    Duration::from_millis(var_or(key, default.as_millis() as u64))
}

impl Config {
    pub fn from_env() -> Self {
        let cache_defaults = CacheConfig::default();
        let metrics_defaults = MetricsConfig::default();
        let concurrency_defaults = ConcurrencyConfig::default();

        Config {
            cache: CacheConfig {
                max_bytes: var_or("SHIELD_CACHE_MAX_BYTES", cache_defaults.max_bytes),
                default_ttl: millis_or("SHIELD_CACHE_DEFAULT_TTL_MS", cache_defaults.default_ttl),
                cleanup_interval: millis_or(
                    "SHIELD_CACHE_CLEANUP_INTERVAL_MS",
                    cache_defaults.cleanup_interval,
                ),
                metrics: MetricsConfig {
                    window_size: var_or("SHIELD_METRICS_WINDOW", metrics_defaults.window_size),
                    slow_threshold: millis_or("SHIELD_SLOW_OP_MS", metrics_defaults.slow_threshold),
                    large_item_threshold: var_or(
                        "SHIELD_LARGE_ITEM_BYTES",
                        metrics_defaults.large_item_threshold,
                    ),
                    top_keys: metrics_defaults.top_keys,
                    max_tracked_keys: var_or(
                        "SHIELD_METRICS_MAX_KEYS",
                        metrics_defaults.max_tracked_keys,
                    ),
                },
            },
            concurrency: ConcurrencyConfig {
                max_concurrency: var_or("SHIELD_MAX_CONCURRENCY", concurrency_defaults.max_concurrency),
                pool_size: var_or("SHIELD_POOL_SIZE", concurrency_defaults.pool_size),
                backlog_size: var_or("SHIELD_BACKLOG_SIZE", concurrency_defaults.backlog_size),
                refill_interval: millis_or("SHIELD_RATE_REFILL_MS", concurrency_defaults.refill_interval),
                burst: var_or("SHIELD_RATE_BURST", concurrency_defaults.burst),
                shutdown_grace: concurrency_defaults.shutdown_grace,
            },
            log_level: env::var("SHIELD_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        }
    }

    /// Reject settings that cannot work
    pub fn validate(&self) -> Result<(), ShieldError> {
        self.cache.validate()?;

        let c = &self.concurrency;
        let checks = [
            (c.max_concurrency == 0, "SHIELD_MAX_CONCURRENCY must be greater than zero"),
            (c.pool_size == 0, "SHIELD_POOL_SIZE must be greater than zero"),
            (c.backlog_size == 0, "SHIELD_BACKLOG_SIZE must be greater than zero"),
            (c.refill_interval.is_zero(), "SHIELD_RATE_REFILL_MS must be greater than zero"),
            (c.burst == 0, "SHIELD_RATE_BURST must be greater than zero"),
        ];
        match checks.iter().find(|(bad, _)| *bad) {
            Some((_, msg)) => Err(ShieldError::InvalidConfig(msg.to_string())),
            None => Ok(()),
        }
    }

    pub fn log_settings(&self) {
        log::info!("Application Configuration Loaded: {:?}", self);
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test touches the environment so parallel tests cannot race on it.
    #[test]
    fn test_from_env_reads_overrides_and_defaults() {
        env::set_var("SHIELD_CACHE_MAX_BYTES", "2048");
        env::set_var("SHIELD_RATE_REFILL_MS", "25");
        env::set_var("SHIELD_POOL_SIZE", "not-a-number");

        let config = Config::from_env();
        assert_eq!(config.cache.max_bytes, 2048);
        assert_eq!(config.concurrency.refill_interval, Duration::from_millis(25));
        assert_eq!(config.concurrency.pool_size, 10);
        assert_eq!(config.cache.default_ttl, Duration::from_millis(300_000));
        assert_eq!(config.concurrency.burst, 50);

        env::remove_var("SHIELD_CACHE_MAX_BYTES");
        env::remove_var("SHIELD_RATE_REFILL_MS");
        env::remove_var("SHIELD_POOL_SIZE");
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        assert!(Config::default().validate().is_ok());

        let mut config = Config::default();
        config.concurrency.burst = 0;
        assert!(matches!(config.validate(), Err(ShieldError::InvalidConfig(msg)) if msg.contains("BURST")));

        let mut config = Config::default();
        config.cache.cleanup_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }
}
