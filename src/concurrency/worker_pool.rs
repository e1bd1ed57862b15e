// src/concurrency/worker_pool.rs
//! Fixed-size worker pool with a bounded backlog.
//!
//! `workers` long-lived tasks pull jobs from one bounded channel. A job
//! that returns an error or panics is counted as failed; the worker that
//! ran it keeps serving the backlog.

use crate::error::{Result, ShieldError};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TrySendError};
use tokio::task::JoinHandle;

const NAME: &str = "worker pool";
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type Job = BoxFuture<'static, anyhow::Result<()>>;

/// Worker pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub tasks_submitted: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub active_workers: usize,
    pub queued: usize,
    pub workers: usize,
    pub backlog_size: usize,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    active: AtomicUsize,
}

pub struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
    size: usize,
    backlog_size: usize,
    shutdown_grace: Duration,
    closed: AtomicBool,
}

impl WorkerPool {
    /// Start `workers` workers sharing a backlog of `backlog_size` jobs.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(workers: usize, backlog_size: usize) -> Result<Self> {
        Self::with_shutdown_grace(workers, backlog_size, DEFAULT_SHUTDOWN_GRACE)
    }

    /// Like [`new`](Self::new), bounding how long `close` waits for the backlog to drain
    pub fn with_shutdown_grace(
        workers: usize,
        backlog_size: usize,
        shutdown_grace: Duration,
    ) -> Result<Self> {
        if workers == 0 {
            return Err(ShieldError::InvalidConfig(
                "worker pool needs at least one worker".to_string(),
            ));
        }
        if backlog_size == 0 {
            return Err(ShieldError::InvalidConfig(
                "worker pool backlog must be greater than zero".to_string(),
            ));
        }

        info!(
            "🚀 Initializing WorkerPool with {} workers, backlog {}",
            workers, backlog_size
        );

        let (sender, receiver) = mpsc::channel::<Job>(backlog_size);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let counters = Arc::new(Counters::default());

        let handles = (0..workers)
            .map(|id| {
                let receiver = Arc::clone(&receiver);
                let counters = Arc::clone(&counters);
                tokio::spawn(Self::run_worker(id, receiver, counters))
            })
            .collect();

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
            counters,
            size: workers,
            backlog_size,
            shutdown_grace,
            closed: AtomicBool::new(false),
        })
    }

    async fn run_worker(
        id: usize,
        receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
        counters: Arc<Counters>,
    ) {
        loop {
            let job = {
                let mut rx = receiver.lock().await;
                rx.recv().await
            };
            let Some(job) = job else { break };

            counters.active.fetch_add(1, Ordering::Relaxed);
            match AssertUnwindSafe(job).catch_unwind().await {
                Ok(Ok(())) => {
                    counters.completed.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!("Worker {} task failed: {}", id, e);
                }
                Err(_) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!("Worker {} task panicked; worker continues", id);
                }
            }
            counters.active.fetch_sub(1, Ordering::Relaxed);
        }
        debug!("Worker {} stopped", id);
    }

    fn sender(&self) -> Result<mpsc::Sender<Job>> {
        if self.is_closed() {
            return Err(ShieldError::Closed(NAME));
        }
        self.sender.lock().clone().ok_or(ShieldError::Closed(NAME))
    }

    fn accepted(&self) {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Enqueue `task`, failing with `QueueFull` if the backlog is saturated
    pub fn submit<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        match self.sender()?.try_send(task.boxed()) {
            Ok(()) => {
                self.accepted();
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(ShieldError::QueueFull),
            Err(TrySendError::Closed(_)) => Err(ShieldError::Closed(NAME)),
        }
    }

    pub fn try_submit<F>(&self, task: F) -> bool
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.submit(task).is_ok()
    }

    /// Enqueue `task`, waiting up to `timeout` for backlog space
    pub async fn submit_with_timeout<F>(&self, task: F, timeout: Duration) -> Result<()>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let sender = self.sender()?;
        match sender.send_timeout(task.boxed(), timeout).await {
            Ok(()) => {
                self.accepted();
                Ok(())
            }
            Err(SendTimeoutError::Timeout(_)) => Err(ShieldError::SubmitTimeout(timeout)),
            Err(SendTimeoutError::Closed(_)) => Err(ShieldError::Closed(NAME)),
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            tasks_submitted: self.counters.submitted.load(Ordering::Relaxed),
            tasks_completed: self.counters.completed.load(Ordering::Relaxed),
            tasks_failed: self.counters.failed.load(Ordering::Relaxed),
            active_workers: self.active_workers(),
            queued: self.queued(),
            workers: self.size,
            backlog_size: self.backlog_size,
        }
    }

    /// Workers currently running a task
    pub fn active_workers(&self) -> usize {
        self.counters.active.load(Ordering::Relaxed)
    }

    /// Tasks waiting in the backlog
    pub fn queued(&self) -> usize {
        self.sender
            .lock()
            .as_ref()
            .map_or(0, |s| s.max_capacity() - s.capacity())
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop accepting work, let the workers drain the backlog, then join them.
    ///
    /// Workers still busy after the shutdown grace period are aborted.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(ShieldError::AlreadyClosed(NAME));
        }
        // Dropping the last sender ends each worker's recv loop once the backlog is empty.
        drop(self.sender.lock().take());

        let mut handles = std::mem::take(&mut *self.workers.lock());
        let drained = tokio::time::timeout(self.shutdown_grace, join_all(handles.iter_mut())).await;
        if drained.is_err() {
            warn!(
                "Worker pool did not drain within {:?}; aborting workers",
                self.shutdown_grace
            );
            for handle in &handles {
                handle.abort();
            }
        }

        let stats = self.stats();
        info!(
            "WorkerPool closed: {} submitted, {} completed, {} failed",
            stats.tasks_submitted, stats.tasks_completed, stats.tasks_failed
        );
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for handle in self.workers.get_mut().iter() {
            handle.abort();
        }
    }
}
