// tests/properties.rs
//! Cross-module properties: bounds, timing shape, resilience and
//! coalescing under contention.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use upstream_shield::{
    generate_key, BoundedStore, CacheConfig, CacheManager, ConcurrencyConfig, ConcurrencyManager,
    Context, RateLimiter, SemaphoreLimiter, ShieldError, WorkerPool,
};

async fn eventually<F: Fn() -> bool>(cond: F) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

#[test]
fn bounded_size_holds_for_mixed_sizes() {
    let store: BoundedStore<String> = BoundedStore::new(4096).unwrap();
    let mut rng = fastrand::Rng::with_seed(7);

    for i in 0..500 {
        let key = format!("key-{}", rng.usize(..64));
        let value = "x".repeat(rng.usize(..1500));
        store.set(key, value, Duration::from_secs(60)).unwrap();
        assert!(
            store.total_size() <= store.max_size(),
            "over budget after set #{i}: {}",
            store.total_size()
        );
    }
}

#[test]
fn expiry_boundary() {
    let store: BoundedStore<String> = BoundedStore::new(4096).unwrap();
    store.set("short", "v".to_string(), Duration::from_millis(50)).unwrap();
    assert!(store.get("short").is_some());

    std::thread::sleep(Duration::from_millis(60));
    assert!(store.get("short").is_none());

    let err = store.set("never", "v".to_string(), Duration::ZERO).unwrap_err();
    assert!(matches!(err, ShieldError::InvalidTtl(_)));
    assert!(store.get("never").is_none());
}

#[test]
fn key_canonicalization() {
    let forward: HashMap<&str, i32> = [("a", 1), ("b", 2)].into_iter().collect();
    let backward: HashMap<&str, i32> = [("b", 2), ("a", 1)].into_iter().collect();
    assert_eq!(
        generate_key("search", &forward, &["x"]),
        generate_key("search", &backward, &["x"])
    );

    let changed: HashMap<&str, i32> = [("a", 1), ("b", 3)].into_iter().collect();
    assert_ne!(
        generate_key("search", &forward, &["x"]),
        generate_key("search", &changed, &["x"])
    );
    assert_ne!(
        generate_key("search", &forward, &["x"]),
        generate_key("search", &forward, &["y"])
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn semaphore_never_exceeds_capacity() {
    const CAPACITY: usize = 3;
    let limiter = Arc::new(SemaphoreLimiter::new(CAPACITY).unwrap());
    let holders = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..40)
        .map(|_| {
            let limiter = limiter.clone();
            let holders = holders.clone();
            let peak = peak.clone();
            tokio::spawn(async move {
                let _slot = limiter.acquire_slot(&Context::background()).await.unwrap();
                let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                assert!(limiter.in_use() <= CAPACITY);
                tokio::time::sleep(Duration::from_millis(2)).await;
                holders.fetch_sub(1, Ordering::SeqCst);
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= CAPACITY);
    assert_eq!(limiter.in_use(), 0);
    assert_eq!(limiter.available() + limiter.in_use(), CAPACITY);
}

#[tokio::test]
async fn rate_limiter_burst_then_interval() {
    let limiter = RateLimiter::new(Duration::from_millis(100), 5).unwrap();
    let ctx = Context::background();

    let started = Instant::now();
    for _ in 0..5 {
        limiter.wait(&ctx).await.unwrap();
    }
    assert!(started.elapsed() < Duration::from_millis(30));

    let before_sixth = Instant::now();
    limiter.wait(&ctx).await.unwrap();
    let waited = before_sixth.elapsed();
    assert!(waited >= Duration::from_millis(60), "sixth call waited {waited:?}");
    assert!(waited < Duration::from_millis(300), "sixth call waited {waited:?}");
}

#[tokio::test]
async fn worker_pool_survives_faults() {
    let pool = WorkerPool::new(1, 4).unwrap();

    pool.submit(async {
        if true {
            panic!("task fault");
        }
        Ok(())
    })
    .unwrap();
    assert!(eventually(|| pool.stats().tasks_failed == 1).await);

    let ran = Arc::new(AtomicUsize::new(0));
    let flag = ran.clone();
    pool.submit(async move {
        flag.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .unwrap();
    assert!(eventually(|| pool.stats().tasks_completed == 1).await);
    assert_eq!(ran.load(Ordering::SeqCst), 1);

    pool.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn coalescing_is_exact_under_contention() {
    let cache = Arc::new(CacheManager::<String>::new(CacheConfig::default()).await.unwrap());
    let computations = Arc::new(AtomicUsize::new(0));

    let callers: Vec<_> = (0..64)
        .map(|i| {
            let cache = cache.clone();
            let computations = computations.clone();
            tokio::spawn(async move {
                let key = format!("k{}", i % 4);
                let label = key.clone();
                cache
                    .get_or_set(&Context::background(), &key, move |_ctx| async move {
                        computations.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(format!("value-of-{label}"))
                    })
                    .await
                    .map(|v| (key, v))
            })
        })
        .collect();

    for caller in callers {
        let (key, value) = caller.await.unwrap().unwrap();
        assert_eq!(value, format!("value-of-{key}"));
    }
    assert_eq!(computations.load(Ordering::SeqCst), 4);
    assert_eq!(cache.stats().coalesced_requests, 60);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn coalesced_errors_reach_every_caller_and_are_not_cached() {
    let cache = Arc::new(CacheManager::<String>::new(CacheConfig::default()).await.unwrap());

    let callers: Vec<_> = (0..5)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_set(&Context::background(), "flaky", |_ctx| async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Err(anyhow::anyhow!("upstream 500"))
                    })
                    .await
            })
        })
        .collect();

    for caller in callers {
        let err = caller.await.unwrap().unwrap_err();
        assert!(matches!(err, ShieldError::Compute(_)));
    }
    assert!(!cache.contains("flaky"));
    assert_eq!(cache.stats().computations, 1);
}

#[tokio::test]
async fn admission_and_work_failures_are_distinguishable() {
    let manager = ConcurrencyManager::new(ConcurrencyConfig {
        max_concurrency: 1,
        ..ConcurrencyConfig::default()
    })
    .unwrap();

    let held = manager.semaphore().acquire_slot(&Context::background()).await.unwrap();
    let rejected: Result<(), ShieldError> = manager
        .execute_with_limits(&Context::with_timeout(Duration::from_millis(30)), || async { Ok(()) })
        .await;
    assert!(matches!(rejected, Err(ShieldError::DeadlineExceeded)));
    drop(held);

    let failed: Result<(), ShieldError> = manager
        .execute_with_limits(&Context::background(), || async {
            Err(ShieldError::Compute(Arc::new(anyhow::anyhow!("bad payload"))))
        })
        .await;
    let err = failed.unwrap_err();
    assert!(!err.is_admission_failure());
    assert!(!err.is_cancellation());

    let stats = manager.stats();
    assert_eq!(stats["rejected_requests"], 1);
    assert_eq!(stats["failed_requests"], 1);
    manager.close().await.unwrap();
}
