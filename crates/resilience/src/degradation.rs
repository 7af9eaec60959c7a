//! Primary/fallback execution.

use std::future::Future;
use std::sync::Arc;

use tracing::{error, warn};

use crate::error::{from_operation, BoxError, ReliabilityError};
use crate::error_tracker::{ErrorTracker, Severity};

/// Runs a fallback when the primary operation fails.
#[derive(Debug, Clone, Default)]
pub struct GracefulDegradation {
    tracker: Option<Arc<ErrorTracker>>,
}

impl GracefulDegradation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_error_tracker(mut self, tracker: Arc<ErrorTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Return the primary's value, or the fallback's if the primary fails.
    ///
    /// The fallback only runs after the primary has failed. When both fail
    /// the result is [`ReliabilityError::GracefulDegradationFailed`] carrying
    /// both errors.
    pub async fn execute<T, E1, E2, P, PFut, F, FFut>(
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
        let primary_err = match primary().await {
            Ok(value) => return Ok(value),
            Err(err) => from_operation(err),
        };

        warn!(context, error = %primary_err, "degradation_fallback");
        self.track(context, &primary_err, Severity::Medium);

        match fallback().await {
            Ok(value) => Ok(value),
            Err(err) => {
                let fallback_err = from_operation(err);
                error!(
                    context,
                    primary = %primary_err,
                    fallback = %fallback_err,
                    "degradation_failed"
                );
                self.track(context, &fallback_err, Severity::High);
                Err(ReliabilityError::GracefulDegradationFailed {
                    primary: primary_err.into_box_error(),
                    fallback: fallback_err.into_box_error(),
                })
            }
        }
    }

    fn track(&self, context: &str, err: &ReliabilityError, severity: Severity) {
        if let Some(tracker) = &self.tracker {
            tracker.record(context, err, severity);
        }
    }
}
