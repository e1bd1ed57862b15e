//! Concurrency Manager Module
//!
//! Composes the rate limiter, the semaphore and the worker pool into one
//! admission gate. Callers pass through the rate limiter first and the
//! semaphore second; the two are never locked together.

use super::rate_limiter::RateLimiter;
use super::semaphore::SemaphoreLimiter;
use super::worker_pool::WorkerPool;
use crate::context::Context;
use crate::error::{Result, ShieldError};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

const NAME: &str = "concurrency manager";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    pub max_concurrency: usize,
    pub pool_size: usize,
    pub backlog_size: usize,
    pub refill_interval: Duration,
    pub burst: usize,
    /// How long `close` lets the worker pool drain
    pub shutdown_grace: Duration,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 100,
            pool_size: 10,
            backlog_size: 1000,
            refill_interval: Duration::from_millis(10),
            burst: 50,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

pub struct ConcurrencyManager {
    limiter: RateLimiter,
    semaphore: SemaphoreLimiter,
    pool: WorkerPool,
    total_requests: AtomicU64,
    rejected_requests: AtomicU64,
    completed_requests: AtomicU64,
    failed_requests: AtomicU64,
    closed: AtomicBool,
    config: ConcurrencyConfig,
}

impl ConcurrencyManager {
    /// Build the gate and start the worker pool; needs a tokio runtime
    pub fn new(config: ConcurrencyConfig) -> Result<Self> {
        let limiter = RateLimiter::new(config.refill_interval, config.burst)?;
        let semaphore = SemaphoreLimiter::new(config.max_concurrency)?;
        let pool = WorkerPool::with_shutdown_grace(
            config.pool_size,
            config.backlog_size,
            config.shutdown_grace,
        )?;

        info!(
            "🚦 ConcurrencyManager ready: {} concurrent, burst {} every {:?}, pool {}x{}",
            config.max_concurrency,
            config.burst,
            config.refill_interval,
            config.pool_size,
            config.backlog_size
        );

        Ok(Self {
            limiter,
            semaphore,
            pool,
            total_requests: AtomicU64::new(0),
            rejected_requests: AtomicU64::new(0),
            completed_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            config,
        })
    }

    pub fn config(&self) -> &ConcurrencyConfig {
        &self.config
    }

    /// Run `f` once a rate-limit token and a concurrency slot are held.
    ///
    /// Admission failures (closed, cancelled, deadline) are returned without
    /// calling `f` and counted as rejected. Errors from `f` come back
    /// unchanged.
    pub async fn execute_with_limits<F, Fut, T, E>(&self, ctx: &Context, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<ShieldError>,
    {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = self.limiter.wait(ctx).await {
            return Err(self.reject(e).into());
        }
        let slot = match self.semaphore.acquire_slot(ctx).await {
            Ok(slot) => slot,
            Err(e) => return Err(self.reject(e).into()),
        };

        let result = f().await;
        drop(slot);

        match &result {
            Ok(_) => self.completed_requests.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.failed_requests.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    fn reject(&self, err: ShieldError) -> ShieldError {
        self.rejected_requests.fetch_add(1, Ordering::Relaxed);
        debug!("Request rejected at admission: {}", err);
        err
    }

    pub fn submit_to_worker_pool<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.pool.submit(task)
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn semaphore(&self) -> &SemaphoreLimiter {
        &self.semaphore
    }

    pub fn worker_pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Get current concurrency metrics
    pub fn stats(&self) -> HashMap<String, Value> {
        let mut metrics = HashMap::new();
        let mut put = |name: &str, value: Value| {
            metrics.insert(name.to_string(), value);
        };

        put("total_requests", self.total_requests.load(Ordering::Relaxed).into());
        put("rejected_requests", self.rejected_requests.load(Ordering::Relaxed).into());
        put("completed_requests", self.completed_requests.load(Ordering::Relaxed).into());
        put("failed_requests", self.failed_requests.load(Ordering::Relaxed).into());
        put("closed", self.is_closed().into());

        put("limiter.available", self.limiter.available().into());
        put("limiter.burst", self.limiter.burst().into());
        put(
            "limiter.refill_interval_ms",
            (self.limiter.refill_interval().as_millis() as u64).into(),
        );

        put("semaphore.capacity", self.semaphore.capacity().into());
        put("semaphore.available", self.semaphore.available().into());
        put("semaphore.in_use", self.semaphore.in_use().into());

        let pool = self.pool.stats();
        put("worker_pool.tasks_submitted", pool.tasks_submitted.into());
        put("worker_pool.tasks_completed", pool.tasks_completed.into());
        put("worker_pool.tasks_failed", pool.tasks_failed.into());
        put("worker_pool.active_workers", pool.active_workers.into());
        put("worker_pool.queued", pool.queued.into());
        put("worker_pool.workers", pool.workers.into());

        metrics
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close every primitive; the first failure is reported after all were tried
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(ShieldError::AlreadyClosed(NAME));
        }

        let results = [
            self.limiter.close(),
            self.semaphore.close(),
            self.pool.close().await,
        ];
        let mut first_err = None;
        for err in results.into_iter().filter_map(|r| r.err()) {
            warn!("Error while closing concurrency manager: {}", err);
            first_err.get_or_insert(err);
        }

        info!("ConcurrencyManager closed");
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
