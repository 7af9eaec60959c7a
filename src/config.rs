//! YAML configuration for the reliability layer.
//!
//! Every section and every field is optional; anything left out takes its
//! default. Durations are integer milliseconds.
//!
//! ## Example YAML Configuration
//!
//! ```yaml
//! circuit_breaker:
//!   enabled: true
//!   threshold: 5
//!   timeout: 60000
//!   success_threshold: 2
//!   half_open_max_calls: 1
//!
//! rate_limit:
//!   enabled: true
//!   max_requests: 100
//!   window_ms: 60000
//!   per_key: false
//!
//! retry:
//!   enabled: true
//!   max_retries: 3
//!   backoff: 1000
//!   max_backoff: 30000
//!   jitter: false
//!
//! error_tracking:
//!   recent_window: 300000
//!   max_records: 1000
//!
//! health:
//!   error_low_water_mark: 10
//! ```

use std::fs;
use std::path::Path;

use resilience::{
    CircuitBreakerConfig, ErrorTrackerConfig, HealthConfig, RateLimitConfig, RetryPolicy,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur when loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Configuration for the whole reliability layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReliabilityConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryPolicy,
    pub error_tracking: ErrorTrackerConfig,
    pub health: HealthConfig,
}

impl ReliabilityConfig {
    /// Load a YAML configuration file from the given path
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigLoadError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse YAML configuration from a string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigLoadError> {
        // An empty document is a valid "all defaults" config.
        let config: ReliabilityConfig = if yaml.trim().is_empty() {
            ReliabilityConfig::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigLoadError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = config;
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn with_error_tracking(mut self, config: ErrorTrackerConfig) -> Self {
        self.error_tracking = config;
        self
    }

    pub fn with_health(mut self, config: HealthConfig) -> Self {
        self.health = config;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        let cb = &self.circuit_breaker;
        if cb.threshold == 0 {
            return Err(invalid("circuit_breaker.threshold must be at least 1"));
        }
        if cb.success_threshold == Some(0) {
            return Err(invalid("circuit_breaker.success_threshold must be at least 1"));
        }
        if cb.half_open_max_calls == 0 {
            return Err(invalid("circuit_breaker.half_open_max_calls must be at least 1"));
        }

        let rl = &self.rate_limit;
        if rl.max_requests == 0 {
            return Err(invalid("rate_limit.max_requests must be at least 1"));
        }
        if rl.window.is_zero() {
            return Err(invalid("rate_limit.window_ms must be greater than 0"));
        }

        let retry = &self.retry;
        if retry.enabled {
            if retry.backoff.is_zero() {
                return Err(invalid("retry.backoff must be greater than 0"));
            }
            if retry.max_backoff < retry.backoff {
                return Err(invalid("retry.max_backoff must not be below retry.backoff"));
            }
        }

        if self.error_tracking.max_records == 0 {
            return Err(invalid("error_tracking.max_records must be at least 1"));
        }

        Ok(())
    }
}

fn invalid(message: &str) -> ConfigLoadError {
    ConfigLoadError::Validation(message.to_string())
}
