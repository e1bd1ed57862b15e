//! Counting semaphore used for admission control.

use crate::context::Context;
use crate::error::{Result, ShieldError};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Semaphore;

const NAME: &str = "semaphore";

/// Bounds the number of concurrent holders to `capacity`.
///
/// Slots are taken with [`acquire`](Self::acquire) or
/// [`try_acquire`](Self::try_acquire) and returned with
/// [`release`](Self::release); [`acquire_slot`](Self::acquire_slot) hands out
/// a guard that releases on drop. A release without a matching acquire is
/// ignored and logged. After [`close`](Self::close) the counts are frozen:
/// acquisitions fail with `Closed` and releases are ignored.
#[derive(Debug)]
pub struct SemaphoreLimiter {
    semaphore: Semaphore,
    capacity: usize,
    in_use: AtomicUsize,
    closed: AtomicBool,
}

impl SemaphoreLimiter {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(ShieldError::InvalidConfig(
                "semaphore capacity must be greater than zero".to_string(),
            ));
        }
        if capacity > Semaphore::MAX_PERMITS {
            return Err(ShieldError::InvalidConfig(format!(
                "semaphore capacity {} exceeds {}",
                capacity,
                Semaphore::MAX_PERMITS
            )));
        }
        debug!("Semaphore limiter created with {} slots", capacity);
        Ok(Self {
            semaphore: Semaphore::new(capacity),
            capacity,
            in_use: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Wait for a free slot, or until `ctx` ends
    pub async fn acquire(&self, ctx: &Context) -> Result<()> {
        if self.is_closed() {
            return Err(ShieldError::Closed(NAME));
        }
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        tokio::select! {
            biased;
            err = ctx.done() => Err(err),
            permit = self.semaphore.acquire() => match permit {
                Ok(permit) => {
                    // Slots are tracked by count, not by guard lifetime.
                    permit.forget();
                    self.in_use.fetch_add(1, Ordering::AcqRel);
                    Ok(())
                }
                Err(_) => Err(ShieldError::Closed(NAME)),
            },
        }
    }

    pub fn try_acquire(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.semaphore.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.in_use.fetch_add(1, Ordering::AcqRel);
                true
            }
            Err(_) => false,
        }
    }

    pub fn release(&self) {
        if self.is_closed() {
            debug!("Release on closed semaphore ignored");
            return;
        }
        let released = self
            .in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if released {
            self.semaphore.add_permits(1);
        } else {
            warn!("Semaphore release without a matching acquire ignored");
        }
    }

    /// Acquire a slot that is released when the guard drops
    pub async fn acquire_slot(&self, ctx: &Context) -> Result<SlotGuard<'_>> {
        self.acquire(ctx).await?;
        Ok(SlotGuard { limiter: self })
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(ShieldError::AlreadyClosed(NAME));
        }
        self.semaphore.close();
        info!(
            "Semaphore limiter closed ({} of {} slots in use)",
            self.in_use(),
            self.capacity
        );
        Ok(())
    }
}

/// A held semaphore slot
#[must_use = "the slot is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct SlotGuard<'a> {
    limiter: &'a SemaphoreLimiter,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(SemaphoreLimiter::new(0), Err(ShieldError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_acquire_release_counts() {
        let limiter = SemaphoreLimiter::new(2).unwrap();
        let ctx = Context::background();

        limiter.acquire(&ctx).await.unwrap();
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        assert_eq!(limiter.in_use(), 2);
        assert_eq!(limiter.available(), 0);

        limiter.release();
        assert_eq!(limiter.in_use(), 1);
        assert_eq!(limiter.available(), 1);
        limiter.release();
        assert_eq!(limiter.available() + limiter.in_use(), limiter.capacity());
    }

    #[tokio::test]
    async fn test_excess_release_is_ignored() {
        let limiter = SemaphoreLimiter::new(1).unwrap();
        limiter.release();
        limiter.release();
        assert_eq!(limiter.available(), 1);
        assert_eq!(limiter.in_use(), 0);
    }

    #[tokio::test]
    async fn test_deadline_while_full() {
        let limiter = SemaphoreLimiter::new(1).unwrap();
        limiter.acquire(&Context::background()).await.unwrap();

        let started = Instant::now();
        let err = limiter
            .acquire(&Context::with_timeout(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, ShieldError::DeadlineExceeded));
        assert!(started.elapsed() >= Duration::from_millis(45));
        assert_eq!(limiter.in_use(), 1);
    }

    #[tokio::test]
    async fn test_cancel_while_full() {
        let limiter = Arc::new(SemaphoreLimiter::new(1).unwrap());
        assert!(limiter.try_acquire());

        let ctx = Context::background();
        let waiter = {
            let limiter = limiter.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { limiter.acquire(&ctx).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        ctx.cancel();
        assert!(matches!(waiter.await.unwrap(), Err(ShieldError::Canceled)));
    }

    #[tokio::test]
    async fn test_slot_guard_releases_on_drop() {
        let limiter = SemaphoreLimiter::new(1).unwrap();
        {
            let _slot = limiter.acquire_slot(&Context::background()).await.unwrap();
            assert_eq!(limiter.in_use(), 1);
        }
        assert_eq!(limiter.in_use(), 0);
        assert_eq!(limiter.available(), 1);
    }

    #[tokio::test]
    async fn test_close_fails_waiters_and_is_checked() {
        let limiter = Arc::new(SemaphoreLimiter::new(1).unwrap());
        assert!(limiter.try_acquire());

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire(&Context::background()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        limiter.close().unwrap();
        assert!(matches!(waiter.await.unwrap(), Err(ShieldError::Closed(_))));
        assert!(matches!(limiter.close(), Err(ShieldError::AlreadyClosed(_))));
        assert!(!limiter.try_acquire());

        // Counts stay frozen after close.
        limiter.release();
        assert_eq!(limiter.in_use(), 1);
    }
}
