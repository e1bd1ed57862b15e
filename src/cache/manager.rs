// src/cache/manager.rs
//! Cache manager: a bounded store plus background sweeping, metrics and
//! request coalescing.
//!
//! `get_or_set` guarantees at most one running computation per key. The
//! first caller to miss registers a coalescing group and starts the
//! computation in a spawned task; later callers for the same key join the
//! group and await the same shared result. Every caller races its own
//! [`Context`] against that result, so one caller giving up never cancels
//! the others. When the last interested caller leaves, the computation is
//! cancelled and nothing is cached.

use super::size::EstimateSize;
use super::storage::{BoundedStore, Removed};
use crate::context::Context;
use crate::error::{Result, ShieldError};
use crate::monitoring::detailed::{DetailedCacheMetrics, MetricsConfig, Operation};
use crate::monitoring::health::HealthReport;
use crate::monitoring::metrics::MetricsSnapshot;
use crate::utils::timing::OpTimer;
use futures::channel::oneshot;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub max_bytes: usize,
    pub default_ttl: Duration,
    pub cleanup_interval: Duration,
    pub metrics: MetricsConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 100 * 1024 * 1024,
            default_ttl: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
            metrics: MetricsConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_bytes == 0 {
            return Err(ShieldError::InvalidConfig(
                "cache max_bytes must be greater than zero".to_string(),
            ));
        }
        if self.default_ttl.is_zero() {
            return Err(ShieldError::InvalidTtl(self.default_ttl));
        }
        if self.cleanup_interval.is_zero() {
            return Err(ShieldError::InvalidConfig(
                "cache cleanup_interval must be greater than zero".to_string(),
            ));
        }
        if self.metrics.window_size == 0 {
            return Err(ShieldError::InvalidConfig(
                "metrics window_size must be greater than zero".to_string(),
            ));
        }
        if self.metrics.max_tracked_keys == 0 {
            return Err(ShieldError::InvalidConfig(
                "metrics max_tracked_keys must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Cache statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: usize,
    pub max_bytes: usize,
    pub in_flight: usize,
    /// Callers that joined an existing computation instead of starting one
    pub coalesced_requests: u64,
    /// Computations actually started by `get_or_set`
    pub computations: u64,
    pub metrics: MetricsSnapshot,
}

type SharedResult<V> = Shared<BoxFuture<'static, Result<V>>>;

/// One in-flight computation and the callers waiting on it
struct InFlight<V> {
    id: u64,
    result: SharedResult<V>,
    waiters: usize,
    cancel: Context,
}

struct Inner<V> {
    store: BoundedStore<V>,
    metrics: Arc<DetailedCacheMetrics>,
    groups: Mutex<HashMap<String, InFlight<V>>>,
    next_group: AtomicU64,
    coalesced: AtomicU64,
    computations: AtomicU64,
    config: CacheConfig,
    shutdown: Context,
    closed: AtomicBool,
}

impl<V> Inner<V>
where
    V: Clone + EstimateSize + Send + Sync + 'static,
{
    fn store_value(&self, key: &str, value: V, ttl: Duration) -> Result<()> {
        let timer = OpTimer::start(Operation::Set);
        let outcome = match self.store.set(key, value, ttl) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.metrics.record_error();
                return Err(e);
            }
        };
        let latency = timer.finish(key, self.config.metrics.slow_threshold);
        self.metrics.record_set(
            key,
            std::any::type_name::<V>(),
            outcome.size,
            outcome.replaced,
            latency,
        );
        if outcome.evicted > 0 {
            debug!(
                "Set '{}' evicted {} entries ({} bytes)",
                key, outcome.evicted, outcome.evicted_bytes
            );
            self.metrics.record_evictions(outcome.evicted, outcome.evicted_bytes);
        }
        Ok(())
    }

    fn record_lookup(&self, key: &str, timer: OpTimer, hit: bool) {
        let latency = timer.finish(key, self.config.metrics.slow_threshold);
        if hit {
            self.metrics.record_hit(key, latency);
        } else {
            self.metrics.record_miss(key, latency);
        }
    }

    fn sweep(&self) -> Removed {
        let removed = self.store.remove_expired();
        if removed.count > 0 {
            debug!(
                "Cache cleanup: evicted {} expired entries ({} bytes)",
                removed.count, removed.bytes
            );
            self.metrics.record_evictions(removed.count, removed.bytes);
        }
        self.metrics.sync_current_bytes(self.store.total_size());
        removed
    }

    /// Remove group `id` for `key` if it is still the registered one
    fn remove_group(&self, key: &str, id: u64) -> Option<InFlight<V>> {
        let mut groups = self.groups.lock();
        match groups.get(key) {
            Some(group) if group.id == id => groups.remove(key),
            _ => None,
        }
    }
}

/// Drops a caller's interest in a group; the last one out cancels it
struct WaiterGuard<V>
where
    V: Clone + EstimateSize + Send + Sync + 'static,
{
    inner: Arc<Inner<V>>,
    key: String,
    id: u64,
}

impl<V> Drop for WaiterGuard<V>
where
    V: Clone + EstimateSize + Send + Sync + 'static,
{
    fn drop(&mut self) {
        let abandoned = {
            let mut groups = self.inner.groups.lock();
            match groups.get_mut(&self.key) {
                Some(group) if group.id == self.id => {
                    group.waiters -= 1;
                    if group.waiters == 0 {
                        groups.remove(&self.key)
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };
        if let Some(group) = abandoned {
            debug!("All callers left '{}', cancelling its computation", self.key);
            group.cancel.cancel();
        }
    }
}

/// Sends the computation result exactly once, tearing the group down first
struct Publisher<V>
where
    V: Clone + EstimateSize + Send + Sync + 'static,
{
    inner: Arc<Inner<V>>,
    key: String,
    id: u64,
    tx: Option<oneshot::Sender<Result<V>>>,
}

impl<V> Publisher<V>
where
    V: Clone + EstimateSize + Send + Sync + 'static,
{
    fn publish(mut self, result: Result<V>) {
        self.inner.remove_group(&self.key, self.id);
        if let Some(tx) = self.tx.take() {
            // Every waiter may already have left; that is fine.
            let _ = tx.send(result);
        }
    }
}

impl<V> Drop for Publisher<V>
where
    V: Clone + EstimateSize + Send + Sync + 'static,
{
    fn drop(&mut self) {
        // Task torn down before publishing: waiters see a closed channel.
        if self.tx.is_some() {
            self.inner.remove_group(&self.key, self.id);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Bounded TTL cache with sweeping, metrics and request coalescing
pub struct CacheManager<V>
where
    V: Clone + EstimateSize + Send + Sync + 'static,
{
    inner: Arc<Inner<V>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<V> CacheManager<V>
where
    V: Clone + EstimateSize + Send + Sync + 'static,
{
    /// Create a new cache manager and start its sweeper
    pub async fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        info!(
            "🗄️ Initializing CacheManager: {} bytes, default TTL {:?}, cleanup every {:?}",
            config.max_bytes, config.default_ttl, config.cleanup_interval
        );

        let inner = Arc::new(Inner {
            store: BoundedStore::new(config.max_bytes)?,
            metrics: Arc::new(DetailedCacheMetrics::new(config.metrics.clone())),
            groups: Mutex::new(HashMap::new()),
            next_group: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            computations: AtomicU64::new(0),
            config,
            shutdown: Context::background(),
            closed: AtomicBool::new(false),
        });

        let sweeper = Self::start_cleanup_task(&inner);
        Ok(Self {
            inner,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    /// Start background cleanup task
    fn start_cleanup_task(inner: &Arc<Inner<V>>) -> JoinHandle<()> {
        let every = inner.config.cleanup_interval;
        let shutdown = inner.shutdown.clone();
        let weak: Weak<Inner<V>> = Arc::downgrade(inner);

        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.done() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.sweep();
                    }
                }
            }
            debug!("Cache sweeper stopped");
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ShieldError::Closed("cache manager"));
        }
        Ok(())
    }

    /// Store `value` under the default TTL
    pub fn set(&self, key: &str, value: V) -> Result<()> {
        self.set_with_ttl(key, value, self.inner.config.default_ttl)
    }

    pub fn set_with_ttl(&self, key: &str, value: V, ttl: Duration) -> Result<()> {
        self.ensure_open()?;
        self.inner.store_value(key, value, ttl)
    }

    /// Cached value for `key`, if present and unexpired
    pub fn get(&self, key: &str) -> Option<V> {
        let timer = OpTimer::start(Operation::Get);
        let value = self.inner.store.get(key);
        self.inner.record_lookup(key, timer, value.is_some());
        value
    }

    pub fn delete(&self, key: &str) -> bool {
        let timer = OpTimer::start(Operation::Delete);
        let freed = self.inner.store.remove(key);
        let latency = timer.finish(key, self.inner.config.metrics.slow_threshold);
        self.inner.metrics.record_delete(freed, latency);
        freed.is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.store.contains(key)
    }

    /// Drop every entry; in-flight computations are left alone
    pub fn clear(&self) -> usize {
        let removed = self.inner.store.clear();
        self.inner.metrics.record_cleared(removed.count, removed.bytes);
        info!("Cleared {} cache entries ({} bytes)", removed.count, removed.bytes);
        removed.count
    }

    /// Run an expiry sweep now instead of waiting for the next tick
    pub fn sweep_expired(&self) -> usize {
        self.inner.sweep().count
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.inner.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.store.is_empty()
    }

    pub fn total_size(&self) -> usize {
        self.inner.store.total_size()
    }

    /// Keys with a computation currently running
    pub fn in_flight(&self) -> usize {
        self.inner.groups.lock().len()
    }

    pub fn metrics(&self) -> Arc<DetailedCacheMetrics> {
        Arc::clone(&self.inner.metrics)
    }

    pub fn health(&self) -> HealthReport {
        self.inner.metrics.sync_current_bytes(self.inner.store.total_size());
        self.inner.metrics.health(self.inner.store.max_size())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.inner.store.len(),
            total_bytes: self.inner.store.total_size(),
            max_bytes: self.inner.store.max_size(),
            in_flight: self.in_flight(),
            coalesced_requests: self.inner.coalesced.load(Ordering::Relaxed),
            computations: self.inner.computations.load(Ordering::Relaxed),
            metrics: self.inner.metrics.basic().stats(),
        }
    }

    /// Return the cached value for `key`, or compute it once for all
    /// concurrent callers.
    ///
    /// `compute` is only invoked by the caller that starts the computation;
    /// it receives a context that ends when the manager closes or every
    /// caller has given up. Successful values are cached with the default
    /// TTL; errors and panics are handed to the waiting callers and never
    /// cached.
    pub async fn get_or_set<F, Fut>(&self, ctx: &Context, key: &str, compute: F) -> Result<V>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        // One lookup is recorded per call: a hit on either check, else a miss.
        let timer = OpTimer::start(Operation::Get);
        if let Some(value) = self.inner.store.get(key) {
            self.inner.record_lookup(key, timer, true);
            return Ok(value);
        }
        if let Err(e) = self.ensure_open() {
            self.inner.record_lookup(key, timer, false);
            return Err(e);
        }

        let (id, shared, leader) = {
            let mut groups = self.inner.groups.lock();
            if let Some(group) = groups.get_mut(key) {
                group.waiters += 1;
                self.inner.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!("Joining in-flight computation for '{}' ({} waiters)", key, group.waiters);
                (group.id, group.result.clone(), None)
            } else {
                // A computation may have published between our miss and this lock.
                if let Some(value) = self.inner.store.get(key) {
                    drop(groups);
                    self.inner.record_lookup(key, timer, true);
                    return Ok(value);
                }
                let id = self.inner.next_group.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel::<Result<V>>();
                let shared = rx
                    .map(|received| received.unwrap_or(Err(ShieldError::Canceled)))
                    .boxed()
                    .shared();
                let compute_ctx = self.inner.shutdown.child();
                groups.insert(
                    key.to_string(),
                    InFlight {
                        id,
                        result: shared.clone(),
                        waiters: 1,
                        cancel: compute_ctx.clone(),
                    },
                );
                (id, shared, Some((tx, compute_ctx)))
            }
        };

        self.inner.record_lookup(key, timer, false);

        let _waiter = WaiterGuard {
            inner: Arc::clone(&self.inner),
            key: key.to_string(),
            id,
        };

        if let Some((tx, compute_ctx)) = leader {
            self.spawn_computation(key, id, tx, compute_ctx, compute);
        }

        tokio::select! {
            biased;
            err = ctx.done() => {
                debug!("Caller for '{}' gave up: {}", key, err);
                Err(err)
            }
            result = shared => result,
        }
    }

    fn spawn_computation<F, Fut>(
        &self,
        key: &str,
        id: u64,
        tx: oneshot::Sender<Result<V>>,
        compute_ctx: Context,
        compute: F,
    ) where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let publisher = Publisher {
            inner: Arc::clone(&self.inner),
            key: key.to_string(),
            id,
            tx: Some(tx),
        };
        self.inner.computations.fetch_add(1, Ordering::Relaxed);
        debug!("Starting computation for '{}'", key);

        let work = compute(compute_ctx.clone());

        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                err = compute_ctx.done() => Err(err),
                caught = AssertUnwindSafe(work).catch_unwind() => match caught {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(ShieldError::from(e)),
                    Err(payload) => Err(ShieldError::ComputePanicked(panic_message(payload.as_ref()))),
                },
            };

            let inner = Arc::clone(&publisher.inner);
            let key = publisher.key.clone();
            match &outcome {
                Ok(value) if !compute_ctx.is_done() => {
                    if let Err(e) = inner.store_value(&key, value.clone(), inner.config.default_ttl) {
                        warn!("Computed value for '{}' was not cached: {}", key, e);
                    }
                }
                Ok(_) => debug!("Dropping value for '{}': computation was cancelled", key),
                Err(ShieldError::ComputePanicked(msg)) => {
                    inner.metrics.record_error();
                    error!("Computation for '{}' panicked: {}", key, msg);
                }
                Err(e) if e.is_cancellation() => {
                    debug!("Computation for '{}' cancelled: {}", key, e);
                }
                Err(e) => {
                    inner.metrics.record_error();
                    debug!("Computation for '{}' failed: {}", key, e);
                }
            }

            publisher.publish(outcome);
        });
    }

    /// Bulk-load `items` with the default TTL.
    ///
    /// Per-item failures do not stop the load; they are collected into
    /// [`ShieldError::Warmup`]. If `ctx` ends the load stops early with the
    /// context's error, keeping whatever was already stored.
    pub async fn warmup<I>(&self, ctx: &Context, items: I) -> Result<usize>
    where
        I: IntoIterator<Item = (String, V)>,
    {
        self.ensure_open()?;
        let mut total = 0;
        let mut warmed = 0;
        let mut errors = Vec::new();

        for (key, value) in items {
            if let Some(err) = ctx.err() {
                warn!("Warmup interrupted after {} items: {}", total, err);
                return Err(err);
            }
            total += 1;
            match self.set(&key, value) {
                Ok(()) => warmed += 1,
                Err(e) => {
                    warn!("Warmup failed for '{}': {}", key, e);
                    errors.push((key, e));
                }
            }
            // Long warmups must not starve the runtime.
            if total % 256 == 0 {
                tokio::task::yield_now().await;
            }
        }

        info!("Cache warmup loaded {} of {} items", warmed, total);
        if errors.is_empty() {
            Ok(warmed)
        } else {
            Err(ShieldError::Warmup {
                failed: errors.len(),
                total,
                errors,
            })
        }
    }

    /// Stop the sweeper and cancel running computations.
    ///
    /// Reads keep working afterwards; writes fail with `Closed`.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Err(ShieldError::AlreadyClosed("cache manager"));
        }
        self.inner.shutdown.cancel();

        let sweeper = self.sweeper.lock().take();
        if let Some(handle) = sweeper {
            if let Err(e) = handle.await {
                warn!("Cache sweeper ended abnormally: {}", e);
            }
        }
        info!("CacheManager closed with {} entries", self.len());
        Ok(())
    }
}

impl<V> Drop for CacheManager<V>
where
    V: Clone + EstimateSize + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}
