//! Telemetry Resilience Primitives
//!
//! Small, independently testable building blocks that keep the telemetry
//! pipeline standing when a storage or streaming sink goes bad:
//!
//! - **Rate limiting** - sliding-window admission per key.
//! - **Circuit breaking** - stop hammering a dependency that keeps failing,
//!   then try it again after a cool-down.
//! - **Retry** - exponential backoff for transient errors, with a classifier
//!   that refuses to retry bad input.
//! - **Graceful degradation** - run a fallback when the primary path fails.
//! - **Error tracking and health** - every failure lands in one rolling log,
//!   and the health view combines it with circuit state.
//!
//! None of these know what they wrap. Operations are plain async closures
//! returning `Result<T, E>` for any `E: Into<BoxError>`.
//!
//! All timing goes through `tokio::time`, so tests can run on a paused clock.
//!
//! ## Quick example
//!
//! ```
//! use resilience::{CircuitBreakerConfig, CircuitBreakerRegistry, RetryExecutor, RetryPolicy};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let circuits = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
//!     let retry = RetryExecutor::new(
//!         RetryPolicy::default().with_backoff(Duration::from_millis(10)),
//!     );
//!
//!     let stored = retry
//!         .execute(
//!             || circuits.execute("storage:primary", || async { Ok::<_, std::io::Error>(42) }),
//!             "storage:primary",
//!         )
//!         .await
//!         .unwrap();
//!     assert_eq!(stored, 42);
//! }
//! ```

pub mod circuit_breaker;
pub mod degradation;
pub mod error;
pub mod error_tracker;
pub mod health;
pub mod rate_limit;
pub mod retry;
mod serde_millis;

pub use circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerRegistry, CircuitCounts, CircuitState, CircuitStats,
};
pub use degradation::GracefulDegradation;
pub use error::{BoxError, ErrorKind, ReliabilityError};
pub use error_tracker::{
    category_of, ErrorRecord, ErrorStats, ErrorTracker, ErrorTrackerConfig, Severity,
    DEFAULT_CATEGORY,
};
pub use health::{
    evaluate as evaluate_health, CircuitSummary, ErrorSummary, HealthConfig, HealthDetails,
    HealthMonitor, HealthSnapshot, HealthStatus,
};
pub use rate_limit::{
    KeyWindowStats, RateLimitConfig, RateLimitKey, RateLimiter, RateLimiterStats, GLOBAL_KEY,
};
pub use retry::{backoff_delay, is_retryable_error, Classifier, RetryExecutor, RetryPolicy};
