// tests/scenarios.rs
//! End-to-end scenarios for the cache and the semaphore.

use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use upstream_shield::{
    BoundedStore, CacheConfig, CacheManager, Context, MetricsConfig, SemaphoreLimiter, ShieldError,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn scenario_a_store_stays_within_budget() {
    init_logging();
    let store: BoundedStore<String> = BoundedStore::new(1024).unwrap();

    // 2-byte key + 54-byte value + 64 bytes overhead = 120 bytes each.
    for i in 0..10 {
        store
            .set(format!("k{i}"), "v".repeat(54), Duration::from_secs(60))
            .unwrap();
        assert!(store.total_size() <= store.max_size());
    }

    assert!(store.len() < 10);
    assert!(store.total_size() <= 1024);
    // The most recent writes survive.
    assert!(store.get("k9").is_some());
    assert!(store.get("k0").is_none());
}

#[tokio::test]
async fn scenario_b_semaphore_deadline() {
    init_logging();
    let limiter = SemaphoreLimiter::new(1).unwrap();
    limiter.acquire(&Context::background()).await.unwrap();

    let started = Instant::now();
    let err = limiter
        .acquire(&Context::with_timeout(Duration::from_millis(100)))
        .await
        .unwrap_err();
    let waited = started.elapsed();

    assert!(matches!(err, ShieldError::DeadlineExceeded));
    assert!(waited >= Duration::from_millis(95), "returned after {waited:?}");
    assert!(waited < Duration::from_millis(500), "returned after {waited:?}");
}

#[tokio::test]
async fn scenario_c_sweeper_expires_entries() {
    init_logging();
    let cache = CacheManager::<String>::new(CacheConfig {
        max_bytes: 1024 * 1024,
        default_ttl: Duration::from_millis(100),
        cleanup_interval: Duration::from_millis(50),
        metrics: MetricsConfig::default(),
    })
    .await
    .unwrap();

    for i in 0..5 {
        cache.set(&format!("key-{i}"), format!("value-{i}")).unwrap();
    }
    assert_eq!(cache.len(), 5);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(cache.len(), 0);
    assert_eq!(cache.total_size(), 0);

    cache.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_d_concurrent_get_or_set_coalesces() {
    init_logging();
    let cache = Arc::new(CacheManager::<String>::new(CacheConfig::default()).await.unwrap());
    let executions = Arc::new(AtomicUsize::new(0));

    let callers: Vec<_> = (0..10)
        .map(|_| {
            let cache = cache.clone();
            let executions = executions.clone();
            tokio::spawn(async move {
                cache
                    .get_or_set(&Context::background(), "k", move |_ctx| async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok("v".to_string())
                    })
                    .await
            })
        })
        .collect();

    for caller in callers {
        assert_eq!(caller.await.unwrap().unwrap(), "v");
    }
    assert_eq!(executions.load(Ordering::SeqCst), 1);

    let stats = cache.stats();
    assert_eq!(stats.computations, 1);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(cache.get("k"), Some("v".to_string()));
}
