//! Sliding-window admission control.
//!
//! Each admission key keeps the timestamps of the calls it admitted during the
//! last `window`. A call is admitted while fewer than `max_requests` timestamps
//! remain after pruning; otherwise it is rejected immediately and nothing is
//! recorded. The window slides with every call, so capacity comes back one
//! admission at a time instead of all at once at a bucket boundary.
//!
//! With `per_key` set, windows that hold no admissions are swept out at most
//! once per window length, so idle tenants don't accumulate. Limiter-wide
//! totals survive the sweep.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::error::ReliabilityError;
use crate::error_tracker::{ErrorTracker, Severity};

/// Key used for every admission when per-key limiting is off.
pub const GLOBAL_KEY: &str = "global";

/// Configuration for rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// When false, every check is admitted.
    pub enabled: bool,
    /// Admissions allowed per key inside one window.
    pub max_requests: u32,
    /// Window length in milliseconds.
    #[serde(rename = "window_ms", with = "crate::serde_millis")]
    pub window: Duration,
    /// Limit each event key separately instead of sharing [`GLOBAL_KEY`].
    pub per_key: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 100,
            window: Duration::from_secs(60),
            per_key: false,
        }
    }
}

impl RateLimitConfig {
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_max_requests(mut self, max: u32) -> Self {
        self.max_requests = max;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_per_key(mut self, per_key: bool) -> Self {
        self.per_key = per_key;
        self
    }
}

/// Anything that names the admission bucket it belongs to.
pub trait RateLimitKey {
    fn rate_limit_key(&self) -> &str;
}

impl RateLimitKey for str {
    fn rate_limit_key(&self) -> &str {
        self
    }
}

impl RateLimitKey for String {
    fn rate_limit_key(&self) -> &str {
        self.as_str()
    }
}

impl<T: RateLimitKey + ?Sized> RateLimitKey for &T {
    fn rate_limit_key(&self) -> &str {
        (**self).rate_limit_key()
    }
}

#[derive(Debug, Default)]
struct RateWindow {
    admissions: VecDeque<Instant>,
    total_admitted: u64,
    total_rejected: u64,
}

impl RateWindow {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.admissions.front() {
            if now.duration_since(oldest) > window {
                self.admissions.pop_front();
            } else {
                break;
            }
        }
    }

    fn admit(&mut self, now: Instant, config: &RateLimitConfig) -> bool {
        self.prune(now, config.window);
        if self.admissions.len() < config.max_requests as usize {
            self.admissions.push_back(now);
            self.total_admitted += 1;
            true
        } else {
            self.total_rejected += 1;
            false
        }
    }

    fn in_window(&self, now: Instant, window: Duration) -> usize {
        self.admissions
            .iter()
            .filter(|&&at| now.duration_since(at) <= window)
            .count()
    }
}

/// Per-key counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyWindowStats {
    /// Admissions currently inside the window.
    pub in_window: u32,
    pub total_admitted: u64,
    pub total_rejected: u64,
}

impl KeyWindowStats {
    /// Rejection rate (0.0 to 1.0).
    pub fn rejection_rate(&self) -> f64 {
        let total = self.total_admitted + self.total_rejected;
        if total == 0 {
            0.0
        } else {
            self.total_rejected as f64 / total as f64
        }
    }
}

/// Snapshot of the limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterStats {
    pub enabled: bool,
    pub max_requests: u32,
    pub window_ms: u64,
    /// Admissions across all keys, including keys since evicted.
    pub total_admitted: u64,
    pub total_rejected: u64,
    /// Keys with a live window.
    pub keys: HashMap<String, KeyWindowStats>,
}

/// Sliding-window rate limiter with one window per key.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: DashMap<String, RateWindow>,
    tracker: Option<Arc<ErrorTracker>>,
    total_admitted: AtomicU64,
    total_rejected: AtomicU64,
    last_sweep: Mutex<Instant>,
    closed: AtomicBool,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
            tracker: None,
            total_admitted: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
            last_sweep: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
        }
    }

    /// Report rejections to `tracker`.
    pub fn with_error_tracker(mut self, tracker: Arc<ErrorTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Admit or reject one call for `event`.
    pub fn check_event<E>(&self, event: &E) -> Result<(), ReliabilityError>
    where
        E: RateLimitKey + ?Sized,
    {
        self.check(event.rate_limit_key())
    }

    /// Admit or reject one call for `key`.
    ///
    /// The per-key critical section is the dashmap shard lock, so two
    /// concurrent admissions for one key never observe the same count.
    pub fn check(&self, key: &str) -> Result<(), ReliabilityError> {
        if self.is_closed() {
            return Err(ReliabilityError::ShutDown);
        }
        if !self.config.enabled {
            return Ok(());
        }

        let key = if self.config.per_key { key } else { GLOBAL_KEY };
        let now = Instant::now();
        let admitted = if let Some(mut window) = self.windows.get_mut(key) {
            window.admit(now, &self.config)
        } else {
            self.windows
                .entry(key.to_string())
                .or_default()
                .admit(now, &self.config)
        };

        // `close` may have cleared the map between the first check and the insert.
        if self.is_closed() {
            self.windows.remove(key);
            return Err(ReliabilityError::ShutDown);
        }
        if self.config.per_key {
            self.sweep_idle(now);
        }

        if admitted {
            self.total_admitted.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        self.total_rejected.fetch_add(1, Ordering::Relaxed);

        let err = ReliabilityError::RateLimitExceeded {
            key: key.to_string(),
        };
        debug!(
            key,
            max_requests = self.config.max_requests,
            window_ms = self.config.window.as_millis() as u64,
            "rate_limit_rejected"
        );
        metrics::counter!("reliability_rate_limit_rejected_total", "key" => key.to_string())
            .increment(1);
        if let Some(tracker) = &self.tracker {
            tracker.record(&format!("rate_limit:{key}"), &err, Severity::Low);
        }
        Err(err)
    }

    /// Current counters per key. Does not mutate any window.
    pub fn stats(&self) -> RateLimiterStats {
        let now = Instant::now();
        let keys = self
            .windows
            .iter()
            .map(|entry| {
                let (key, window) = entry.pair();
                let stats = KeyWindowStats {
                    in_window: window.in_window(now, self.config.window) as u32,
                    total_admitted: window.total_admitted,
                    total_rejected: window.total_rejected,
                };
                (key.clone(), stats)
            })
            .collect();

        RateLimiterStats {
            enabled: self.config.enabled,
            max_requests: self.config.max_requests,
            window_ms: self.config.window.as_millis() as u64,
            total_admitted: self.total_admitted.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
            keys,
        }
    }

    /// Forget every window and reject all later checks.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.windows.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Drop windows with no admissions left, at most once per window length.
    fn sweep_idle(&self, now: Instant) {
        {
            let mut last = match self.last_sweep.try_lock() {
                Ok(last) => last,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => return,
            };
            if now.duration_since(*last) < self.config.window {
                return;
            }
            *last = now;
        }

        let window = self.config.window;
        let before = self.windows.len();
        self.windows.retain(|_, w| {
            w.prune(now, window);
            !w.admissions.is_empty()
        });
        let evicted = before.saturating_sub(self.windows.len());
        if evicted > 0 {
            debug!(evicted, "rate_limit_windows_evicted");
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
