//! Aggregate health view over circuits and recent errors.
//!
//! | Status | Condition |
//! |--------|-----------|
//! | `unhealthy` | at least `unhealthy_min_open` circuits Open, and more than half of the known circuits Open |
//! | `degraded` | any circuit Open or HalfOpen, or recent errors above the low-water mark |
//! | `healthy` | otherwise |

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::circuit_breaker::{CircuitBreakerRegistry, CircuitCounts};
use crate::error_tracker::ErrorTracker;

/// Health thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Recent errors tolerated before reporting `degraded`.
    pub error_low_water_mark: u64,
    /// Open circuits required before a majority counts as `unhealthy`.
    /// A lone dependency going down only degrades the system.
    pub unhealthy_min_open: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            error_low_water_mark: 10,
            unhealthy_min_open: 2,
        }
    }
}

impl HealthConfig {
    pub fn with_error_low_water_mark(mut self, mark: u64) -> Self {
        self.error_low_water_mark = mark;
        self
    }

    pub fn with_unhealthy_min_open(mut self, min: usize) -> Self {
        self.unhealthy_min_open = min;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub recent: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSummary {
    pub open_count: usize,
    pub half_open_count: usize,
    pub total: usize,
}

impl From<CircuitCounts> for CircuitSummary {
    fn from(counts: CircuitCounts) -> Self {
        Self {
            open_count: counts.open,
            half_open_count: counts.half_open,
            total: counts.total(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthDetails {
    pub errors: ErrorSummary,
    pub circuits: CircuitSummary,
    pub timestamp: DateTime<Utc>,
}

/// Point-in-time health report, serialized as the health endpoint body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub details: HealthDetails,
}

impl HealthSnapshot {
    /// Snapshot of a system with no circuits and no errors.
    pub fn healthy_now() -> Self {
        Self {
            status: HealthStatus::Healthy,
            details: HealthDetails {
                errors: ErrorSummary::default(),
                circuits: CircuitSummary::default(),
                timestamp: Utc::now(),
            },
        }
    }
}

/// Classify health from circuit and error counts.
pub fn evaluate(
    config: &HealthConfig,
    circuits: &CircuitSummary,
    errors: &ErrorSummary,
) -> HealthStatus {
    if circuits.open_count > 0
        && circuits.open_count >= config.unhealthy_min_open
        && circuits.open_count * 2 > circuits.total
    {
        HealthStatus::Unhealthy
    } else if circuits.open_count > 0
        || circuits.half_open_count > 0
        || errors.recent > config.error_low_water_mark
    {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

/// Reads circuit and error state on demand; holds no state of its own.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    config: HealthConfig,
    circuits: Arc<CircuitBreakerRegistry>,
    errors: Arc<ErrorTracker>,
}

impl HealthMonitor {
    pub fn new(
        config: HealthConfig,
        circuits: Arc<CircuitBreakerRegistry>,
        errors: Arc<ErrorTracker>,
    ) -> Self {
        Self {
            config,
            circuits,
            errors,
        }
    }

    pub fn status(&self) -> HealthSnapshot {
        let circuits = CircuitSummary::from(self.circuits.counts());
        let stats = self.errors.stats();
        let errors = ErrorSummary {
            recent: stats.recent,
            total: stats.total,
        };

        HealthSnapshot {
            status: evaluate(&self.config, &circuits, &errors),
            details: HealthDetails {
                errors,
                circuits,
                timestamp: Utc::now(),
            },
        }
    }
}
