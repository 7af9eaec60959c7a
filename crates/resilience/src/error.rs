//! Error types produced by the reliability primitives.
//!
//! Wrapped operations may fail with any error type convertible into a
//! [`BoxError`]. The primitives either pass that error through unchanged
//! ([`ReliabilityError::Operation`]) or replace it with one of the
//! reliability-specific kinds below.
//!
//! | Error | Raised by | Operation invoked? |
//! |-------|-----------|--------------------|
//! | [`RateLimitExceeded`](ReliabilityError::RateLimitExceeded) | rate limiter | no |
//! | [`CircuitOpen`](ReliabilityError::CircuitOpen) | circuit breaker | no |
//! | [`NonRetryable`](ReliabilityError::NonRetryable) | retry executor | once |
//! | [`RetryExhausted`](ReliabilityError::RetryExhausted) | retry executor | `max_retries + 1` times |
//! | [`GracefulDegradationFailed`](ReliabilityError::GracefulDegradationFailed) | degradation executor | primary and fallback |
//! | [`Operation`](ReliabilityError::Operation) | any wrapper | yes, error passed through |
//! | [`Cancelled`](ReliabilityError::Cancelled) | retry executor | zero or more times |
//! | [`ShutDown`](ReliabilityError::ShutDown) | manager facade, closed limiter or registry | no |

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Type-erased error returned by wrapped operations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Fieldless discriminant of [`ReliabilityError`], handy for matching and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimitExceeded,
    CircuitOpen,
    NonRetryable,
    RetryExhausted,
    GracefulDegradationFailed,
    Operation,
    Cancelled,
    ShutDown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimitExceeded => "rate_limit_exceeded",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::NonRetryable => "non_retryable",
            ErrorKind::RetryExhausted => "retry_exhausted",
            ErrorKind::GracefulDegradationFailed => "graceful_degradation_failed",
            ErrorKind::Operation => "operation",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::ShutDown => "shut_down",
        }
    }
}

/// Errors surfaced by the reliability layer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReliabilityError {
    /// The admission window for `key` is full. The attempt was not recorded.
    #[error("Rate limit exceeded")]
    RateLimitExceeded { key: String },

    /// The circuit for `key` is open; the operation was not invoked.
    #[error("Circuit breaker is open")]
    CircuitOpen { key: String },

    /// The classifier rejected the error as permanent; no retry was attempted.
    #[error("Non-retryable error")]
    NonRetryable { source: BoxError },

    /// Every attempt failed. `last` is the error of the final attempt.
    #[error("All retry attempts failed")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: BoxError,
    },

    /// Both the primary and the fallback operation failed.
    #[error("Both primary and fallback operations failed")]
    GracefulDegradationFailed {
        primary: BoxError,
        #[source]
        fallback: BoxError,
    },

    /// The wrapped operation's own error, unmodified.
    #[error(transparent)]
    Operation(BoxError),

    /// A cancellation token fired before the retry sequence finished.
    #[error("Operation cancelled")]
    Cancelled { attempts: u32 },

    /// The owning manager has been shut down.
    #[error("Reliability manager has been shut down")]
    ShutDown,
}

impl ReliabilityError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReliabilityError::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            ReliabilityError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            ReliabilityError::NonRetryable { .. } => ErrorKind::NonRetryable,
            ReliabilityError::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            ReliabilityError::GracefulDegradationFailed { .. } => {
                ErrorKind::GracefulDegradationFailed
            }
            ReliabilityError::Operation(_) => ErrorKind::Operation,
            ReliabilityError::Cancelled { .. } => ErrorKind::Cancelled,
            ReliabilityError::ShutDown => ErrorKind::ShutDown,
        }
    }

    /// Local rejections that never invoked the wrapped operation.
    ///
    /// These are surfaced as-is by outer wrappers and never retried.
    pub fn is_short_circuit(&self) -> bool {
        matches!(
            self,
            ReliabilityError::RateLimitExceeded { .. }
                | ReliabilityError::CircuitOpen { .. }
                | ReliabilityError::ShutDown
        )
    }

    /// Unwrap a pass-through error back into the operation's own error.
    ///
    /// Other variants are boxed as they are.
    pub fn into_box_error(self) -> BoxError {
        match self {
            ReliabilityError::Operation(inner) => inner,
            other => Box::new(other),
        }
    }
}

/// Lift an operation error into the reliability taxonomy.
///
/// An error that already is a [`ReliabilityError`] (a nested wrapper's result)
/// is kept as-is so it never double-wraps as `Operation(Operation(..))`.
pub(crate) fn from_operation<E: Into<BoxError>>(err: E) -> ReliabilityError {
    let boxed: BoxError = err.into();
    match boxed.downcast::<ReliabilityError>() {
        Ok(nested) => *nested,
        Err(other) => ReliabilityError::Operation(other),
    }
}
