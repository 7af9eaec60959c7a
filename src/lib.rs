//! Reliability layer for telemetry ingestion.
//!
//! [`ReliabilityManager`] is the one object the pipeline talks to. It owns a
//! rate limiter, a circuit breaker per dependency key, a retry executor, a
//! primary/fallback executor and the shared error log. It holds no knowledge
//! of what it wraps.
//!
//! The usual call chain: check the rate limit before enqueueing an event, then
//! wrap the sink write in a circuit breaker, optionally inside a retry.
//!
//! ```
//! use reliability::{ReliabilityConfig, ReliabilityManager};
//!
//! #[tokio::main]
//! async fn main() {
//!     let manager = ReliabilityManager::new(ReliabilityConfig::default()).unwrap();
//!
//!     manager.check_rate_limit("tenant-a").unwrap();
//!     let written = manager
//!         .execute_with_retry(
//!             || {
//!                 manager.execute_with_circuit_breaker("storage:primary", || async {
//!                     Ok::<_, std::io::Error>(128)
//!                 })
//!             },
//!             "storage:primary",
//!         )
//!         .await
//!         .unwrap();
//!
//!     assert_eq!(written, 128);
//!     assert_eq!(manager.get_health_status().status.as_str(), "healthy");
//!     manager.shutdown();
//! }
//! ```

pub mod config;

pub use config::{ConfigLoadError, ReliabilityConfig};
pub use resilience::{
    BoxError, CircuitBreakerConfig, CircuitState, CircuitStats, ErrorKind, ErrorRecord,
    ErrorStats, ErrorTrackerConfig, HealthConfig, HealthSnapshot, HealthStatus, KeyWindowStats,
    RateLimitConfig, RateLimitKey, RateLimiterStats, ReliabilityError, RetryPolicy, Severity,
    category_of, is_retryable_error,
};

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use resilience::{
    CircuitBreakerRegistry, ErrorTracker, GracefulDegradation, HealthMonitor, RateLimiter,
    RetryExecutor,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Composes the reliability primitives behind one shared error log.
#[derive(Debug)]
pub struct ReliabilityManager {
    config: ReliabilityConfig,
    errors: Arc<ErrorTracker>,
    rate_limiter: RateLimiter,
    circuits: Arc<CircuitBreakerRegistry>,
    retry: RetryExecutor,
    degradation: GracefulDegradation,
    health: HealthMonitor,
    shutdown_token: CancellationToken,
    shut_down: AtomicBool,
}

impl ReliabilityManager {
    /// Validate `config` and build every primitive.
    pub fn new(config: ReliabilityConfig) -> Result<Self, ConfigLoadError> {
        config.validate()?;

        let errors = Arc::new(ErrorTracker::new(config.error_tracking));
        let rate_limiter = RateLimiter::new(config.rate_limit).with_error_tracker(errors.clone());
        let circuits = Arc::new(
            CircuitBreakerRegistry::new(config.circuit_breaker).with_error_tracker(errors.clone()),
        );
        let shutdown_token = CancellationToken::new();
        let retry = RetryExecutor::new(config.retry)
            .with_error_tracker(errors.clone())
            .with_shutdown_token(shutdown_token.clone());
        let degradation = GracefulDegradation::new().with_error_tracker(errors.clone());
        let health = HealthMonitor::new(config.health, circuits.clone(), errors.clone());

        Ok(Self {
            config,
            errors,
            rate_limiter,
            circuits,
            retry,
            degradation,
            health,
            shutdown_token,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ReliabilityConfig {
        &self.config
    }

    /// Admit or reject one event.
    ///
    /// The event's own key is used only when `rate_limit.per_key` is set.
    pub fn check_rate_limit<E>(&self, event: &E) -> Result<(), ReliabilityError>
    where
        E: RateLimitKey + ?Sized,
    {
        self.ensure_running()?;
        self.rate_limiter.check_event(event)
    }

    /// Run `operation` under the circuit breaker for `key`.
    pub async fn execute_with_circuit_breaker<T, E, F, Fut>(
        &self,
        key: &str,
        operation: F,
    ) -> Result<T, ReliabilityError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        self.ensure_running()?;
        self.circuits.execute(key, operation).await
    }

    /// Run `operation` with exponential-backoff retries.
    ///
    /// Errors are recorded under `context`.
    pub async fn execute_with_retry<T, E, F, Fut>(
        &self,
        operation: F,
        context: &str,
    ) -> Result<T, ReliabilityError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        self.ensure_running()?;
        self.retry.execute(operation, context).await
    }

    /// [`execute_with_retry`](Self::execute_with_retry) that also stops when
    /// `token` is cancelled.
    pub async fn execute_with_retry_cancellable<T, E, F, Fut>(
        &self,
        operation: F,
        context: &str,
        token: &CancellationToken,
    ) -> Result<T, ReliabilityError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        self.ensure_running()?;
        self.retry.execute_cancellable(operation, context, token).await
    }

    /// Run `primary`, falling back to `fallback` if it fails.
    pub async fn execute_with_graceful_degradation<T, E1, E2, P, PFut, F, FFut>(
        &self,
        primary: P,
        fallback: F,
        context: &str,
    ) -> Result<T, ReliabilityError>
    where
        P: FnOnce() -> PFut,
        PFut: Future<Output = Result<T, E1>>,
        E1: Into<BoxError>,
        F: FnOnce() -> FFut,
        FFut: Future<Output = Result<T, E2>>,
        E2: Into<BoxError>,
    {
        self.ensure_running()?;
        self.degradation.execute(primary, fallback, context).await
    }

    pub fn get_health_status(&self) -> HealthSnapshot {
        self.health.status()
    }

    pub fn get_circuit_breaker_stats(&self) -> HashMap<String, CircuitStats> {
        self.circuits.stats()
    }

    pub fn get_rate_limiter_stats(&self) -> RateLimiterStats {
        self.rate_limiter.stats()
    }

    pub fn get_error_stats(&self) -> ErrorStats {
        self.errors.stats()
    }

    /// Newest recorded failures first.
    pub fn recent_errors(&self, limit: usize) -> Vec<ErrorRecord> {
        self.errors.recent_errors(limit)
    }

    /// Put the circuit for `key` back into a fresh Closed state.
    pub fn reset_circuit_breaker(&self, key: &str) {
        self.circuits.reset(key);
    }

    /// Cancel pending backoff timers and drop all in-memory state.
    ///
    /// Safe to call repeatedly and while operations are in flight: running
    /// operations finish and return to their callers, but their outcomes are
    /// no longer recorded. Later calls fail with [`ReliabilityError::ShutDown`].
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        info!(
            circuits = self.circuits.counts().total(),
            errors_total = self.errors.stats().total,
            "reliability_shutdown"
        );
        self.shutdown_token.cancel();
        self.errors.close();
        self.rate_limiter.close();
        self.circuits.close();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<(), ReliabilityError> {
        if self.is_shut_down() {
            Err(ReliabilityError::ShutDown)
        } else {
            Ok(())
        }
    }
}
