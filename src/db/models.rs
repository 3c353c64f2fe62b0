//! Database model types.

use chrono::{DateTime, Utc};

/// Status code recorded when a probe failed before any HTTP response arrived.
pub const FAILED_STATUS: u16 = 0;

/// What a single probe produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The target answered with an HTTP status.
    Response {
        status_code: u16,
        /// First characters of the body, best-effort.
        preview: String,
    },
    /// No HTTP response (refused, timed out, DNS, TLS...).
    Failed { error: String },
}

/// One persisted probe outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub target_name: String,
    pub target_url: String,
    /// When the probe was sent, not when it finished.
    pub timestamp: DateTime<Utc>,
    pub response_time_ms: i64,
    pub outcome: ProbeOutcome,
}

impl Event {
    /// HTTP status, or [`FAILED_STATUS`] when the probe never got one.
    pub fn status_code(&self) -> u16 {
        match &self.outcome {
            ProbeOutcome::Response { status_code, .. } => *status_code,
            ProbeOutcome::Failed { .. } => FAILED_STATUS,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, ProbeOutcome::Failed { .. })
    }

    pub fn response_preview(&self) -> Option<&str> {
        match &self.outcome {
            ProbeOutcome::Response { preview, .. } => Some(preview),
            ProbeOutcome::Failed { .. } => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.outcome {
            ProbeOutcome::Response { .. } => None,
            ProbeOutcome::Failed { error } => Some(error),
        }
    }
}

/// Predicate for [`super::EventLog::find_latest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    Any,
    Failed,
    Succeeded,
}

/// Expiry horizons for the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Every event older than this is dropped.
    pub event_horizon: chrono::Duration,
    /// Events with status 200 are dropped after this shorter horizon.
    pub healthy_horizon: chrono::Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            event_horizon: chrono::Duration::days(60),
            healthy_horizon: chrono::Duration::days(7),
        }
    }
}

/// Rows removed by one expiry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    pub expired: usize,
    pub expired_healthy: usize,
}
