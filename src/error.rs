//! Error types for quota enforcement.

use std::time::Duration;

use thiserror::Error;

use crate::ratelimit::CallKind;

/// Main error type for quotaguard operations.
#[derive(Error, Debug)]
pub enum QuotaError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The shared store could not be reached or rejected a command.
    ///
    /// The core never retries the failed command itself; callers may retry
    /// the whole admission.
    #[error("Shared store error: {0}")]
    Store(#[from] redis::RedisError),

    /// A leased lock could not be obtained before the acquire timeout.
    #[error("Lock {lock} unavailable after waiting {waited:?}")]
    LockUnavailable {
        /// Name of the contended lock
        lock: String,
        /// How long acquisition was attempted
        waited: Duration,
    },

    /// Cost estimation failed (tokenizer could not be loaded, or the cost
    /// overflowed)
    #[error("Cost estimation error: {0}")]
    Estimator(String),

    /// A call shape was handed to an estimator bound to another kind.
    #[error("Estimator for {expected} calls cannot price {actual} calls")]
    ShapeMismatch {
        /// Kind the estimator was built for
        expected: CallKind,
        /// Kind of the offending call
        actual: CallKind,
    },

    /// The wait was cancelled by a shutdown signal between attempts.
    #[error("Wait for capacity cancelled")]
    Cancelled,

    /// The caller's deadline passed before capacity became available.
    #[error("Deadline exceeded while waiting for capacity")]
    DeadlineExceeded,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl QuotaError {
    /// Whether retrying the whole admission later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, QuotaError::Store(_) | QuotaError::LockUnavailable { .. })
    }
}

impl From<config::ConfigError> for QuotaError {
    fn from(err: config::ConfigError) -> Self {
        QuotaError::Config(err.to_string())
    }
}

/// Result type alias for quotaguard operations.
pub type Result<T> = std::result::Result<T, QuotaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_are_retryable() {
        let err = QuotaError::from(redis::RedisError::from((
            redis::ErrorKind::IoError,
            "connection refused",
        )));
        assert!(err.is_retryable());

        let err = QuotaError::LockUnavailable {
            lock: "chat:lock".to_string(),
            waited: Duration::from_millis(250),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_other_errors_are_not_retryable() {
        assert!(!QuotaError::Config("bad".to_string()).is_retryable());
        assert!(!QuotaError::Cancelled.is_retryable());
        assert!(!QuotaError::DeadlineExceeded.is_retryable());
    }

    #[test]
    fn test_shape_mismatch_message() {
        let err = QuotaError::ShapeMismatch {
            expected: CallKind::Chat,
            actual: CallKind::Embedding,
        };
        assert_eq!(
            err.to_string(),
            "Estimator for chat calls cannot price embedding calls"
        );
    }
}
