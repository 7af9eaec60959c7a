//! Rolling log of failures seen by the reliability layer.
//!
//! Every primitive reports the failures it observes here, tagged with the
//! operation context (e.g. `storage:provider`) and a [`Severity`]. The tracker
//! keeps all-time counters, a per-instant tally of failures inside a trailing
//! time window (the "recent" count used by the health view) and a detailed log
//! bounded by both that window and `max_records`. The tally is independent of
//! the log cap, so a burst larger than `max_records` is still counted in full.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::trace;

/// Category used for contexts without a `prefix:` part.
pub const DEFAULT_CATEGORY: &str = "general";

/// How bad a recorded failure is.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derive the error category from an operation context.
///
/// The category is the part before the first `:`; contexts without a
/// non-empty prefix fall into [`DEFAULT_CATEGORY`].
///
/// ```
/// use resilience::category_of;
///
/// assert_eq!(category_of("storage:provider"), "storage");
/// assert_eq!(category_of("flush"), "general");
/// ```
pub fn category_of(context: &str) -> &str {
    match context.split_once(':') {
        Some((prefix, _)) if !prefix.trim().is_empty() => prefix.trim(),
        _ => DEFAULT_CATEGORY,
    }
}

/// Tuning for the rolling error log.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorTrackerConfig {
    /// Trailing window for the "recent" count, in milliseconds.
    #[serde(with = "crate::serde_millis")]
    pub recent_window: Duration,
    /// Hard cap on retained records; oldest are dropped first.
    pub max_records: usize,
}

impl Default for ErrorTrackerConfig {
    fn default() -> Self {
        Self {
            recent_window: Duration::from_secs(5 * 60),
            max_records: 1000,
        }
    }
}

impl ErrorTrackerConfig {
    pub fn with_recent_window(mut self, window: Duration) -> Self {
        self.recent_window = window;
        self
    }

    pub fn with_max_records(mut self, max: usize) -> Self {
        self.max_records = max;
        self
    }
}

/// One recorded failure.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub category: String,
    pub severity: Severity,
    pub context: String,
    pub message: String,
    #[serde(skip)]
    recorded_at: Instant,
}

/// Snapshot of error counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorStats {
    /// All failures recorded since creation.
    pub total: u64,
    /// Failures within the trailing window.
    pub recent: u64,
    pub by_severity: HashMap<Severity, u64>,
    pub by_category: HashMap<String, u64>,
}

#[derive(Debug, Default)]
struct TrackerState {
    records: VecDeque<ErrorRecord>,
    /// Failures per recording instant, oldest first.
    window: VecDeque<(Instant, u64)>,
    recent: u64,
    total: u64,
    by_severity: HashMap<Severity, u64>,
    by_category: HashMap<String, u64>,
}

impl TrackerState {
    fn push_recent(&mut self, now: Instant) {
        match self.window.back_mut() {
            Some((at, count)) if *at == now => *count += 1,
            _ => self.window.push_back((now, 1)),
        }
        self.recent += 1;
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&(at, count)) = self.window.front() {
            if now.duration_since(at) <= window {
                break;
            }
            self.window.pop_front();
            self.recent -= count;
        }
        while let Some(oldest) = self.records.front() {
            if now.duration_since(oldest.recorded_at) > window {
                self.records.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Append-only failure log shared by all primitives.
#[derive(Debug, Default)]
pub struct ErrorTracker {
    config: ErrorTrackerConfig,
    state: Mutex<TrackerState>,
    closed: AtomicBool,
}

impl ErrorTracker {
    pub fn new(config: ErrorTrackerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(TrackerState::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ErrorTrackerConfig {
        &self.config
    }

    /// Record a failure. Never fails; a closed tracker ignores the call.
    pub fn record<M>(&self, context: &str, error: &M, severity: Severity)
    where
        M: fmt::Display + ?Sized,
    {
        if self.is_closed() {
            return;
        }

        let category = category_of(context).to_string();
        let message = error.to_string();
        let now = Instant::now();
        {
            let mut state = self.lock();
            // Re-checked under the lock so nothing lands after `close`.
            if self.is_closed() {
                return;
            }
            state.total += 1;
            *state.by_severity.entry(severity).or_insert(0) += 1;
            *state.by_category.entry(category.clone()).or_insert(0) += 1;
            state.push_recent(now);
            state.records.push_back(ErrorRecord {
                timestamp: Utc::now(),
                category: category.clone(),
                severity,
                context: context.to_string(),
                message: message.clone(),
                recorded_at: now,
            });
            while state.records.len() > self.config.max_records {
                state.records.pop_front();
            }
        }

        trace!(
            context,
            category = %category,
            severity = %severity,
            error = %message,
            "error_recorded"
        );
        metrics::counter!(
            "reliability_errors_recorded_total",
            "category" => category,
            "severity" => severity.as_str()
        )
        .increment(1);
    }

    /// Current counters. Expired records are pruned as a side effect.
    pub fn stats(&self) -> ErrorStats {
        let mut state = self.lock();
        state.prune(Instant::now(), self.config.recent_window);
        ErrorStats {
            total: state.total,
            recent: state.recent,
            by_severity: state.by_severity.clone(),
            by_category: state.by_category.clone(),
        }
    }

    /// Newest retained records first, at most `limit` of them.
    pub fn recent_errors(&self, limit: usize) -> Vec<ErrorRecord> {
        let mut state = self.lock();
        state.prune(Instant::now(), self.config.recent_window);
        state.records.iter().rev().take(limit).cloned().collect()
    }

    /// Drop all state and ignore further records.
    pub fn close(&self) {
        let mut state = self.lock();
        self.closed.store(true, Ordering::Release);
        *state = TrackerState::default();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
