//! Cancellation and deadline propagation for blocking operations.
//!
//! A [`Context`] is handed to every call that may suspend (semaphore
//! acquire, limiter wait, coalesced cache fills). It ends either because
//! someone cancelled it or because its deadline passed, and the two are
//! reported as different errors.

use crate::error::ShieldError;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that never ends on its own
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().child_with_timeout(timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self::background().child_with_deadline(deadline)
    }

    /// Derive a context that ends when this one does, or when cancelled itself
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// A timeout past the clock's range behaves like no timeout at all
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.child_with_deadline(deadline),
            None => self.child(),
        }
    }

    /// The earlier of the parent's deadline and `deadline` wins
    pub fn child_with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Why the context has ended, or `None` while it is still live
    pub fn err(&self) -> Option<ShieldError> {
        if self.token.is_cancelled() {
            return Some(ShieldError::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ShieldError::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolves once the context ends, yielding the reason
    pub async fn done(&self) -> ShieldError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => ShieldError::Canceled,
                    _ = sleep_until(deadline) => ShieldError::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                ShieldError::Canceled
            }
        }
    }

    /// Run `fut` unless the context ends first
    pub async fn run<F, T>(&self, fut: F) -> Result<T, ShieldError>
    where
        F: std::future::Future<Output = T>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            out = fut => Ok(out),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}
