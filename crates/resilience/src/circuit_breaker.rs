//! Per-key circuit breaking around async operations.
//!
//! # State transitions
//! ```text
//! Closed   -> Open:     consecutive failures reach `threshold`
//! Open     -> HalfOpen: `timeout` elapsed; the same call becomes a trial
//! HalfOpen -> Closed:   consecutive trial successes reach the closing threshold
//! HalfOpen -> Open:     any trial failure (fresh `opened_at`)
//! ```
//!
//! Each key owns one breaker record behind its own mutex, created lazily on
//! first use. The lock covers admission and outcome bookkeeping only; it is
//! never held while the wrapped operation runs.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{from_operation, BoxError, ReliabilityError};
use crate::error_tracker::{ErrorTracker, Severity};

/// States of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - requests allowed.
    Closed,
    /// Failing fast - requests immediately rejected.
    Open,
    /// Testing if the dependency recovered - limited trial requests allowed.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// When false, operations run directly; failures are still tracked.
    pub enabled: bool,
    /// Consecutive failures before opening the circuit.
    pub threshold: u32,
    /// Time spent Open before a trial call is let through, in milliseconds.
    #[serde(with = "crate::serde_millis")]
    pub timeout: Duration,
    /// Consecutive HalfOpen successes required to close. Defaults to `threshold`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_threshold: Option<u32>,
    /// Concurrent trial calls allowed while HalfOpen.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 5,
            timeout: Duration::from_secs(60),
            success_threshold: None,
            half_open_max_calls: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = Some(threshold);
        self
    }

    pub fn with_half_open_max_calls(mut self, calls: u32) -> Self {
        self.half_open_max_calls = calls;
        self
    }

    /// Consecutive HalfOpen successes needed to close the circuit.
    pub fn closing_threshold(&self) -> u32 {
        self.success_threshold.unwrap_or(self.threshold)
    }
}

/// Which path a call was admitted through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Closed,
    Trial,
}

/// Admission path plus the state period it was granted in.
#[derive(Debug, Clone, Copy)]
struct Ticket {
    admission: Admission,
    epoch: u64,
}

/// Mutable per-key breaker state.
#[derive(Debug)]
struct CircuitRecord {
    state: CircuitState,
    /// Bumped on every state change; outcomes from an older epoch are ignored.
    epoch: u64,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    trials_in_flight: u32,
}

impl CircuitRecord {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            epoch: 0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            trials_in_flight: 0,
        }
    }

    fn stats(&self, now: Instant) -> CircuitStats {
        CircuitStats {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
            opened_for_ms: match (self.state, self.opened_at) {
                (CircuitState::Open, Some(at)) => Some(now.duration_since(at).as_millis() as u64),
                _ => None,
            },
        }
    }

    fn enter(&mut self, state: CircuitState) {
        self.state = state;
        self.epoch += 1;
        self.consecutive_successes = 0;
        self.trials_in_flight = 0;
    }

    fn open(&mut self, now: Instant) {
        self.enter(CircuitState::Open);
        self.opened_at = Some(now);
    }

    /// Returns the admission ticket, or `None` when the call must be rejected,
    /// plus the state entered on the way, if any.
    fn try_admit(
        &mut self,
        now: Instant,
        config: &CircuitBreakerConfig,
    ) -> (Option<Ticket>, Option<CircuitState>) {
        let mut transition = None;
        if self.state == CircuitState::Open {
            let elapsed = self
                .opened_at
                .map_or(true, |at| now.duration_since(at) >= config.timeout);
            if !elapsed {
                return (None, None);
            }
            self.enter(CircuitState::HalfOpen);
            transition = Some(CircuitState::HalfOpen);
        }

        let admission = match self.state {
            CircuitState::Closed => Some(Admission::Closed),
            CircuitState::HalfOpen if self.trials_in_flight < config.half_open_max_calls => {
                self.trials_in_flight += 1;
                Some(Admission::Trial)
            }
            _ => None,
        };
        let ticket = admission.map(|admission| Ticket {
            admission,
            epoch: self.epoch,
        });
        (ticket, transition)
    }

    fn on_success(&mut self, ticket: Ticket, config: &CircuitBreakerConfig) -> Option<CircuitState> {
        if ticket.epoch != self.epoch {
            return None;
        }
        match (ticket.admission, self.state) {
            (Admission::Closed, CircuitState::Closed) => {
                self.consecutive_failures = 0;
                None
            }
            (Admission::Trial, CircuitState::HalfOpen) => {
                self.consecutive_successes += 1;
                if self.consecutive_successes >= config.closing_threshold() {
                    self.enter(CircuitState::Closed);
                    self.consecutive_failures = 0;
                    self.opened_at = None;
                    Some(CircuitState::Closed)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    fn on_failure(
        &mut self,
        ticket: Ticket,
        now: Instant,
        config: &CircuitBreakerConfig,
    ) -> Option<CircuitState> {
        if ticket.epoch != self.epoch {
            return None;
        }
        match (ticket.admission, self.state) {
            (Admission::Closed, CircuitState::Closed) => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= config.threshold {
                    self.open(now);
                    Some(CircuitState::Open)
                } else {
                    None
                }
            }
            (Admission::Trial, CircuitState::HalfOpen) => {
                self.consecutive_failures += 1;
                self.open(now);
                Some(CircuitState::Open)
            }
            _ => None,
        }
    }

    fn release_trial(&mut self, ticket: Ticket) {
        if ticket.admission == Admission::Trial && ticket.epoch == self.epoch {
            self.trials_in_flight = self.trials_in_flight.saturating_sub(1);
        }
    }
}

/// Observable state of one circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// Time spent Open so far; `None` unless Open.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_for_ms: Option<u64>,
}

/// Number of known circuits in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitCounts {
    pub closed: usize,
    pub open: usize,
    pub half_open: usize,
}

impl CircuitCounts {
    pub fn total(&self) -> usize {
        self.closed + self.open + self.half_open
    }
}

fn lock(record: &Mutex<CircuitRecord>) -> MutexGuard<'_, CircuitRecord> {
    record.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Admission handed to one call. Frees its trial slot if the call is dropped
/// before reporting an outcome.
struct CallPermit {
    record: Arc<Mutex<CircuitRecord>>,
    ticket: Ticket,
    settled: bool,
}

impl CallPermit {
    fn succeed(mut self, config: &CircuitBreakerConfig) -> Option<CircuitState> {
        self.settled = true;
        let mut record = lock(&self.record);
        record.release_trial(self.ticket);
        record.on_success(self.ticket, config)
    }

    fn fail(mut self, now: Instant, config: &CircuitBreakerConfig) -> Option<CircuitState> {
        self.settled = true;
        let mut record = lock(&self.record);
        record.release_trial(self.ticket);
        record.on_failure(self.ticket, now, config)
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.settled {
            lock(&self.record).release_trial(self.ticket);
        }
    }
}

/// Circuit breakers keyed by operation name (one per key).
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    circuits: DashMap<String, Arc<Mutex<CircuitRecord>>>,
    tracker: Option<Arc<ErrorTracker>>,
    closed: AtomicBool,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: DashMap::new(),
            tracker: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Report failures and rejections to `tracker`.
    pub fn with_error_tracker(mut self, tracker: Arc<ErrorTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `operation` under the circuit for `key`.
    ///
    /// An Open circuit rejects with [`ReliabilityError::CircuitOpen`] without
    /// invoking the operation. The operation's own error is returned as
    /// [`ReliabilityError::Operation`]. A closed registry rejects with
    /// [`ReliabilityError::ShutDown`].
    pub async fn execute<T, E, F, Fut>(&self, key: &str, operation: F) -> Result<T, ReliabilityError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        if self.is_closed() {
            return Err(ReliabilityError::ShutDown);
        }
        if !self.config.enabled {
            return operation().await.map_err(|err| {
                let err = from_operation(err);
                self.track(key, &err, Severity::Medium);
                err
            });
        }

        let record = self.get_or_create(key)?;
        let (ticket, transition) = lock(&record).try_admit(Instant::now(), &self.config);
        if let Some(to) = transition {
            self.log_transition(key, to);
        }

        let Some(ticket) = ticket else {
            let err = ReliabilityError::CircuitOpen {
                key: key.to_string(),
            };
            self.track(key, &err, Severity::Low);
            return Err(err);
        };

        let permit = CallPermit {
            record,
            ticket,
            settled: false,
        };

        match operation().await {
            Ok(value) => {
                if let Some(to) = permit.succeed(&self.config) {
                    self.log_transition(key, to);
                }
                Ok(value)
            }
            Err(err) => {
                let err = from_operation(err);
                let transition = permit.fail(Instant::now(), &self.config);
                let severity = match transition {
                    Some(CircuitState::Open) => Severity::High,
                    _ => Severity::Medium,
                };
                self.track(key, &err, severity);
                if let Some(to) = transition {
                    self.log_transition(key, to);
                }
                Err(err)
            }
        }
    }

    /// Get or lazily create the record for `key`.
    fn get_or_create(&self, key: &str) -> Result<Arc<Mutex<CircuitRecord>>, ReliabilityError> {
        let record = match self.circuits.get(key) {
            Some(record) => record.clone(),
            None => self
                .circuits
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(CircuitRecord::new())))
                .clone(),
        };
        // `close` may have cleared the map between the first check and the insert.
        if self.is_closed() {
            self.circuits.remove(key);
            return Err(ReliabilityError::ShutDown);
        }
        Ok(record)
    }

    /// State of `key`, if it has been used.
    pub fn state(&self, key: &str) -> Option<CircuitState> {
        self.circuits.get(key).map(|record| lock(&record).state)
    }

    /// Whether calls for `key` currently pass (unknown keys are healthy).
    pub fn is_healthy(&self, key: &str) -> bool {
        self.state(key)
            .map(|state| state != CircuitState::Open)
            .unwrap_or(true)
    }

    /// Stats for all known keys.
    pub fn stats(&self) -> HashMap<String, CircuitStats> {
        let now = Instant::now();
        self.circuits
            .iter()
            .map(|entry| {
                let (key, record) = entry.pair();
                (key.clone(), lock(record).stats(now))
            })
            .collect()
    }

    pub fn counts(&self) -> CircuitCounts {
        let mut counts = CircuitCounts::default();
        for entry in self.circuits.iter() {
            match lock(entry.value()).state {
                CircuitState::Closed => counts.closed += 1,
                CircuitState::Open => counts.open += 1,
                CircuitState::HalfOpen => counts.half_open += 1,
            }
        }
        counts
    }

    /// Return `key` to a fresh Closed circuit.
    pub fn reset(&self, key: &str) {
        self.circuits.remove(key);
    }

    /// Forget every circuit.
    pub fn reset_all(&self) {
        self.circuits.clear();
    }

    /// Forget every circuit and reject all later calls.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.circuits.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn track(&self, key: &str, err: &ReliabilityError, severity: Severity) {
        if let Some(tracker) = &self.tracker {
            tracker.record(key, err, severity);
        }
    }

    fn log_transition(&self, key: &str, to: CircuitState) {
        metrics::counter!(
            "reliability_circuit_transitions_total",
            "key" => key.to_string(),
            "to" => to.as_str()
        )
        .increment(1);
        match to {
            CircuitState::Open => warn!(
                key,
                threshold = self.config.threshold,
                timeout_ms = self.config.timeout.as_millis() as u64,
                "circuit_opened"
            ),
            CircuitState::HalfOpen => info!(key, "circuit_half_open"),
            CircuitState::Closed => info!(key, "circuit_closed"),
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
