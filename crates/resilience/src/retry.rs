//! Retry logic with exponential backoff for transient failures.
//!
//! The first attempt runs immediately. Each failure is classified: permanent
//! errors abort at once, transient ones are retried after an exponentially
//! growing delay until `max_retries` extra attempts have been spent.
//! Backoff waits go through the tokio timer and never block a worker thread.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{from_operation, BoxError, ReliabilityError};
use crate::error_tracker::{ErrorTracker, Severity};

/// Decides from an error message whether another attempt may succeed.
pub type Classifier = fn(&str) -> bool;

/// Configuration for retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// When false, the operation is invoked exactly once.
    pub enabled: bool,
    /// Attempts allowed after the first one.
    pub max_retries: u32,
    /// Delay before the first retry in milliseconds, doubled on each retry.
    #[serde(with = "crate::serde_millis")]
    pub backoff: Duration,
    /// Upper bound for a single backoff delay in milliseconds.
    #[serde(with = "crate::serde_millis")]
    pub max_backoff: Duration,
    /// Add up to 25% random delay on top of each backoff.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_secs(30),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_backoff(mut self, max: Duration) -> Self {
        self.max_backoff = max;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }
}

/// Delay before retry number `retry` (1-based).
///
/// `min(backoff * 2^(retry - 1), max_backoff)`, plus up to a quarter of that
/// when jitter is enabled.
///
/// ```
/// use resilience::{backoff_delay, RetryPolicy};
/// use std::time::Duration;
///
/// let policy = RetryPolicy::default().with_backoff(Duration::from_millis(100));
/// assert_eq!(backoff_delay(&policy, 1), Duration::from_millis(100));
/// assert_eq!(backoff_delay(&policy, 3), Duration::from_millis(400));
/// ```
pub fn backoff_delay(policy: &RetryPolicy, retry: u32) -> Duration {
    let exponent = retry.saturating_sub(1).min(31);
    let delay = policy
        .backoff
        .saturating_mul(1u32 << exponent)
        .min(policy.max_backoff);

    if policy.jitter {
        let range = u64::try_from(delay.as_millis() / 4).unwrap_or(u64::MAX);
        if range > 0 {
            return delay + Duration::from_millis(fastrand::u64(0..=range));
        }
    }
    delay
}

/// Default classifier: everything is transient except input and auth errors.
pub fn is_retryable_error(error: &str) -> bool {
    let error_lower = error.to_lowercase();

    // Retrying cannot fix a bad payload or missing credentials.
    !(error_lower.contains("invalid")
        || error_lower.contains("validation")
        || error_lower.contains("malformed")
        || error_lower.contains("unauthorized")
        || error_lower.contains("forbidden")
        || error_lower.contains("schema"))
}

/// Runs async operations under a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    classifier: Classifier,
    tracker: Option<Arc<ErrorTracker>>,
    shutdown: Option<CancellationToken>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            classifier: is_retryable_error,
            tracker: None,
            shutdown: None,
        }
    }

    /// Replace the default [`is_retryable_error`] classifier.
    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Report failed attempts to `tracker`.
    pub fn with_error_tracker(mut self, tracker: Arc<ErrorTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Abort every sequence run by this executor when `token` is cancelled.
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds, fails permanently or runs out of attempts.
    pub async fn execute<T, E, F, Fut>(
        &self,
        operation: F,
        context: &str,
    ) -> Result<T, ReliabilityError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        self.run(operation, context, None).await
    }

    /// Like [`execute`](Self::execute), but gives up with
    /// [`ReliabilityError::Cancelled`] once `token` fires.
    ///
    /// Cancellation is observed before each attempt and during backoff; a
    /// running attempt is never interrupted.
    pub async fn execute_cancellable<T, E, F, Fut>(
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
        self.run(operation, context, Some(token)).await
    }

    async fn run<T, E, F, Fut>(
        &self,
        mut operation: F,
        context: &str,
        token: Option<&CancellationToken>,
    ) -> Result<T, ReliabilityError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        if !self.policy.enabled {
            return operation().await.map_err(|err| {
                let err = from_operation(err);
                if !err.is_short_circuit() {
                    self.track(context, &err, Severity::Medium);
                }
                err
            });
        }

        let mut attempts = 0u32;
        loop {
            if self.is_cancelled(token) {
                return Err(ReliabilityError::Cancelled { attempts });
            }

            attempts += 1;
            metrics::counter!("reliability_retry_attempts_total", "context" => context.to_string())
                .increment(1);

            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => from_operation(err),
            };

            // Local rejections from a nested wrapper are surfaced as they are.
            if err.is_short_circuit() {
                return Err(err);
            }

            let message = err.to_string();
            if !(self.classifier)(&message) {
                warn!(context, attempts, error = %message, "retry_non_retryable");
                self.track(context, &message, Severity::Medium);
                return Err(ReliabilityError::NonRetryable {
                    source: err.into_box_error(),
                });
            }

            if attempts > self.policy.max_retries {
                warn!(context, attempts, error = %message, "retry_exhausted");
                self.track(context, &message, Severity::High);
                return Err(ReliabilityError::RetryExhausted {
                    attempts,
                    last: err.into_box_error(),
                });
            }

            self.track(context, &message, Severity::Low);
            let delay = backoff_delay(&self.policy, attempts);
            debug!(
                context,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "retry_attempt_failed"
            );

            tokio::select! {
                _ = sleep(delay) => {}
                _ = wait_cancelled(self.shutdown.as_ref(), token) => {
                    return Err(ReliabilityError::Cancelled { attempts });
                }
            }
        }
    }

    fn is_cancelled(&self, token: Option<&CancellationToken>) -> bool {
        self.shutdown.as_ref().is_some_and(CancellationToken::is_cancelled)
            || token.is_some_and(CancellationToken::is_cancelled)
    }

    fn track<M>(&self, context: &str, error: &M, severity: Severity)
    where
        M: std::fmt::Display + ?Sized,
    {
        if let Some(tracker) = &self.tracker {
            tracker.record(context, error, severity);
        }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

/// Resolves once either token is cancelled; never resolves without tokens.
async fn wait_cancelled(shutdown: Option<&CancellationToken>, token: Option<&CancellationToken>) {
    match (shutdown, token) {
        (Some(a), Some(b)) => {
            tokio::select! {
                _ = a.cancelled() => {}
                _ = b.cancelled() => {}
            }
        }
        (Some(only), None) | (None, Some(only)) => only.cancelled().await,
        (None, None) => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::error_tracker::DEFAULT_CATEGORY;
    use std::error::Error as _;
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn executor(max_retries: u32, backoff_ms: u64) -> RetryExecutor {
        RetryExecutor::new(
            RetryPolicy::default()
                .with_max_retries(max_retries)
                .with_backoff(Duration::from_millis(backoff_ms)),
        )
    }

    #[test]
    fn backoff_doubles_and_is_capped() {
        let policy = RetryPolicy::default()
            .with_backoff(Duration::from_millis(100))
            .with_max_backoff(Duration::from_millis(500));
        assert_eq!(backoff_delay(&policy, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&policy, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(&policy, 3), Duration::from_millis(400));
        assert_eq!(backoff_delay(&policy, 4), Duration::from_millis(500));
        assert_eq!(backoff_delay(&policy, 200), Duration::from_millis(500));
    }

    #[test]
    fn jitter_adds_at_most_a_quarter() {
        let policy = RetryPolicy::default()
            .with_backoff(Duration::from_millis(400))
            .with_jitter(true);
        for _ in 0..50 {
            let delay = backoff_delay(&policy, 1);
            assert!(delay >= Duration::from_millis(400));
            assert!(delay <= Duration::from_millis(500));
        }
    }

    #[test]
    fn classifier_rejects_input_errors() {
        assert!(!is_retryable_error("Invalid format"));
        assert!(!is_retryable_error("schema mismatch on field ts"));
        assert!(!is_retryable_error("401 Unauthorized"));
        assert!(is_retryable_error("connection reset by peer"));
        assert!(is_retryable_error("timeout after 5s"));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let executor = executor(2, 100);
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result = executor
            .execute(
                || async {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(io::Error::other("connection reset"))
                    } else {
                        Ok("stored")
                    }
                },
                "storage:provider",
            )
            .await;

        assert_eq!(result.unwrap(), "stored");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_max_retries_plus_one_attempts() {
        let executor = executor(2, 100);
        let calls = AtomicU32::new(0);

        let err = executor
            .execute(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(io::Error::other("upstream unavailable"))
                },
                "storage:provider",
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.to_string(), "All retry attempts failed");
        match &err {
            ReliabilityError::RetryExhausted { attempts, last } => {
                assert_eq!(*attempts, 3);
                assert_eq!(last.to_string(), "upstream unavailable");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_aborts_immediately() {
        let tracker = Arc::new(ErrorTracker::default());
        let executor = executor(3, 100).with_error_tracker(tracker.clone());
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let err = executor
            .execute(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(io::Error::other("Invalid format"))
                },
                "storage:provider",
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.kind(), ErrorKind::NonRetryable);
        assert_eq!(err.source().map(|s| s.to_string()).as_deref(), Some("Invalid format"));
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(tracker.stats().total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn every_failed_attempt_is_recorded() {
        let tracker = Arc::new(ErrorTracker::default());
        let executor = executor(2, 10).with_error_tracker(tracker.clone());
        let _ = executor
            .execute(
                || async { Err::<(), _>(io::Error::other("timeout")) },
                "streaming:provider",
            )
            .await;

        let stats = tracker.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_category.get("streaming"), Some(&3));
        assert_eq!(stats.by_severity.get(&Severity::Low), Some(&2));
        assert_eq!(stats.by_severity.get(&Severity::High), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn short_circuit_errors_are_not_retried() {
        let executor = executor(3, 100);
        let calls = AtomicU32::new(0);

        let err = executor
            .execute(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(ReliabilityError::CircuitOpen {
                        key: "storage:provider".into(),
                    })
                },
                "storage:provider",
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
    }

    #[tokio::test]
    async fn disabled_retry_invokes_once_and_still_tracks() {
        let tracker = Arc::new(ErrorTracker::default());
        let executor = RetryExecutor::new(RetryPolicy::default().with_enabled(false))
            .with_error_tracker(tracker.clone());
        let calls = AtomicU32::new(0);

        let err = executor
            .execute(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(io::Error::other("timeout"))
                },
                "flush",
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.kind(), ErrorKind::Operation);
        assert_eq!(err.to_string(), "timeout");

        let stats = tracker.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.by_category.get(DEFAULT_CATEGORY), Some(&1));
        assert_eq!(stats.by_severity.get(&Severity::Medium), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let executor = executor(5, 1000);
        let token = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let run = executor.execute_cancellable(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(io::Error::other("timeout"))
            },
            "storage:provider",
            &token,
        );
        let cancel = async {
            sleep(Duration::from_millis(50)).await;
            token.cancel();
        };

        let (result, ()) = tokio::join!(run, cancel);
        match result.unwrap_err() {
            ReliabilityError::Cancelled { attempts } => assert_eq!(attempts, 1),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_token_skips_the_first_attempt() {
        let executor = executor(1, 10);
        let token = CancellationToken::new();
        token.cancel();
        let calls = AtomicU32::new(0);

        let err = executor
            .execute_cancellable(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, io::Error>(())
                },
                "flush",
                &token,
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(matches!(err, ReliabilityError::Cancelled { attempts: 0 }));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_token_cancels_plain_execute() {
        let shutdown = CancellationToken::new();
        let executor = executor(5, 1000).with_shutdown_token(shutdown.clone());

        let run = executor.execute(
            || async { Err::<(), _>(io::Error::other("timeout")) },
            "storage:provider",
        );
        let cancel = async {
            sleep(Duration::from_millis(10)).await;
            shutdown.cancel();
        };

        let (result, ()) = tokio::join!(run, cancel);
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn custom_classifier_is_used() {
        let executor = executor(3, 10).with_classifier(|_| false);
        let err = executor
            .execute(|| async { Err::<(), _>(io::Error::other("timeout")) }, "flush")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NonRetryable);
    }
}
