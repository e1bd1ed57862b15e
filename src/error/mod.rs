use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ShieldError {
    /// TTL of zero duration; entries must live for some positive interval
    #[error("Invalid TTL: {0:?} (must be greater than zero)")]
    InvalidTtl(Duration),

    /// Capacity, size or interval settings that cannot work
    #[error("Invalid Configuration: {0}")]
    InvalidConfig(String),

    /// A single entry larger than the whole store budget
    #[error("Item Too Large: key '{key}' needs {size} bytes, store holds at most {max}")]
    ItemTooLarge { key: String, size: usize, max: usize },

    /// Worker pool backlog is saturated
    #[error("Worker pool queue is full")]
    QueueFull,

    /// Backlog did not free a slot in time
    #[error("Submit timeout after {0:?}")]
    SubmitTimeout(Duration),

    /// Operation on a primitive that has been closed
    #[error("{0} is closed")]
    Closed(&'static str),

    /// Second close of the same primitive
    #[error("{0} is already closed")]
    AlreadyClosed(&'static str),

    /// The caller's context was cancelled explicitly
    #[error("context canceled")]
    Canceled,

    /// The caller's context deadline elapsed
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// The compute callback returned an error
    #[error("Compute Error: {0}")]
    Compute(Arc<anyhow::Error>),

    /// The compute callback panicked
    #[error("Compute Panicked: {0}")]
    ComputePanicked(String),

    /// One or more warmup items failed; the rest were cached
    #[error("Warmup failed for {failed} of {total} items")]
    Warmup {
        failed: usize,
        total: usize,
        errors: Vec<(String, ShieldError)>,
    },
}

impl From<anyhow::Error> for ShieldError {
    fn from(err: anyhow::Error) -> Self {
        // Keep our own variants intact when they travel through anyhow.
        match err.downcast::<ShieldError>() {
            Ok(shield) => shield,
            Err(other) => ShieldError::Compute(Arc::new(other)),
        }
    }
}

impl ShieldError {
    /// Whether a caller may reasonably retry the same operation later
    pub fn is_recoverable(&self) -> bool {
        match self.categorize() {
            ErrorCategory::Admission => true,
            ErrorCategory::Cancellation => true,
            ErrorCategory::Compute => true,
            ErrorCategory::Validation => false,
            ErrorCategory::Lifecycle => false,
        }
    }

    /// Categorizes error for metrics and caller policy
    pub fn categorize(&self) -> ErrorCategory {
        match self {
            ShieldError::InvalidTtl(_) => ErrorCategory::Validation,
            ShieldError::InvalidConfig(_) => ErrorCategory::Validation,
            ShieldError::ItemTooLarge { .. } => ErrorCategory::Validation,
            ShieldError::QueueFull => ErrorCategory::Admission,
            ShieldError::SubmitTimeout(_) => ErrorCategory::Admission,
            ShieldError::Closed(_) => ErrorCategory::Lifecycle,
            ShieldError::AlreadyClosed(_) => ErrorCategory::Lifecycle,
            ShieldError::Canceled => ErrorCategory::Cancellation,
            ShieldError::DeadlineExceeded => ErrorCategory::Cancellation,
            ShieldError::Compute(_) => ErrorCategory::Compute,
            ShieldError::ComputePanicked(_) => ErrorCategory::Compute,
            ShieldError::Warmup { .. } => ErrorCategory::Validation,
        }
    }

    /// True for `Canceled` and `DeadlineExceeded`
    pub fn is_cancellation(&self) -> bool {
        matches!(self.categorize(), ErrorCategory::Cancellation)
    }

    /// True when a limiter, semaphore or pool turned the request away
    pub fn is_admission_failure(&self) -> bool {
        matches!(self, ShieldError::Closed(_)) || self.categorize() == ErrorCategory::Admission
    }
}

/// Error categories for caller retry policy and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Validation,
    Admission,
    Cancellation,
    Compute,
    Lifecycle,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Admission => "admission",
            ErrorCategory::Cancellation => "cancellation",
            ErrorCategory::Compute => "compute",
            ErrorCategory::Lifecycle => "lifecycle",
        }
    }
}

pub type Result<T, E = ShieldError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories_follow_taxonomy() {
        assert_eq!(ShieldError::InvalidTtl(Duration::ZERO).categorize(), ErrorCategory::Validation);
        assert_eq!(ShieldError::QueueFull.categorize(), ErrorCategory::Admission);
        assert_eq!(ShieldError::Canceled.categorize(), ErrorCategory::Cancellation);
        assert_eq!(ShieldError::DeadlineExceeded.categorize(), ErrorCategory::Cancellation);
        assert_eq!(ShieldError::AlreadyClosed("semaphore").categorize(), ErrorCategory::Lifecycle);
        assert!(ShieldError::Closed("rate limiter").is_admission_failure());
        assert!(!ShieldError::InvalidConfig("x".into()).is_recoverable());
        assert!(ShieldError::SubmitTimeout(Duration::from_millis(5)).is_recoverable());
    }

    #[test]
    fn test_anyhow_round_trip_keeps_variant() {
        let wrapped: anyhow::Error = ShieldError::DeadlineExceeded.into();
        assert!(matches!(ShieldError::from(wrapped), ShieldError::DeadlineExceeded));

        let foreign = anyhow::anyhow!("upstream returned 503");
        match ShieldError::from(foreign) {
            ShieldError::Compute(inner) => assert_eq!(inner.to_string(), "upstream returned 503"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(ShieldError::Closed("semaphore").to_string(), "semaphore is closed");
        assert_eq!(
            ShieldError::AlreadyClosed("worker pool").to_string(),
            "worker pool is already closed"
        );
        let err = ShieldError::Warmup { failed: 2, total: 5, errors: vec![] };
        assert_eq!(err.to_string(), "Warmup failed for 2 of 5 items");
    }
}
