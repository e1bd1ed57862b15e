//! Token-bucket rate limiter.
//!
//! Holds up to `burst` tokens and earns one back every `refill_interval`.
//! Refill is computed lazily from elapsed time whenever the bucket is
//! touched, so no background task is needed.

use crate::context::Context;
use crate::error::{Result, ShieldError};
use log::{debug, info};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::{sleep, Instant};

const NAME: &str = "rate limiter";

#[derive(Debug)]
struct Bucket {
    tokens: usize,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
    refill_interval: Duration,
    burst: usize,
    closed: AtomicBool,
    shutdown: Context,
}

impl RateLimiter {
    /// A full bucket of `burst` tokens, refilled one per `refill_interval`
    pub fn new(refill_interval: Duration, burst: usize) -> Result<Self> {
        if refill_interval.is_zero() {
            return Err(ShieldError::InvalidConfig(
                "rate limiter refill interval must be greater than zero".to_string(),
            ));
        }
        if burst == 0 {
            return Err(ShieldError::InvalidConfig(
                "rate limiter burst must be greater than zero".to_string(),
            ));
        }
        debug!(
            "Rate limiter created: burst {}, one token every {:?}",
            burst, refill_interval
        );
        Ok(Self {
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
            refill_interval,
            burst,
            closed: AtomicBool::new(false),
            shutdown: Context::background(),
        })
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        if bucket.tokens >= self.burst {
            // A full bucket earns nothing; the clock restarts from here.
            bucket.last_refill = now;
            return;
        }
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        let earned = (elapsed.as_nanos() / self.refill_interval.as_nanos()) as usize;
        if earned == 0 {
            return;
        }
        bucket.tokens = (bucket.tokens + earned).min(self.burst);
        if bucket.tokens >= self.burst {
            bucket.last_refill = now;
        } else {
            bucket.last_refill += self.refill_interval * earned as u32;
        }
    }

    /// Take a token, or report how long until the next one is earned
    fn take(&self) -> std::result::Result<(), Duration> {
        let now = Instant::now();
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, now);
        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            return Ok(());
        }
        let since = now.saturating_duration_since(bucket.last_refill);
        Err(self.refill_interval.saturating_sub(since))
    }

    /// Wait for a token, or until `ctx` ends or the limiter closes
    pub async fn wait(&self, ctx: &Context) -> Result<()> {
        loop {
            if self.is_closed() {
                return Err(ShieldError::Closed(NAME));
            }
            if let Some(err) = ctx.err() {
                return Err(err);
            }
            let delay = match self.take() {
                Ok(()) => return Ok(()),
                Err(delay) => delay,
            };
            tokio::select! {
                biased;
                err = ctx.done() => return Err(err),
                _ = self.shutdown.done() => return Err(ShieldError::Closed(NAME)),
                _ = sleep(delay) => {}
            }
        }
    }

    pub fn try_wait(&self) -> bool {
        !self.is_closed() && self.take().is_ok()
    }

    /// Tokens available right now
    pub fn available(&self) -> usize {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, Instant::now());
        bucket.tokens
    }

    pub fn burst(&self) -> usize {
        self.burst
    }

    pub fn refill_interval(&self) -> Duration {
        self.refill_interval
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(ShieldError::AlreadyClosed(NAME));
        }
        self.shutdown.cancel();
        info!("Rate limiter closed");
        Ok(())
    }
}
