//! Metrics for the change tracker
//!
//! Thin wrappers over the `metrics` facade; with no recorder installed
//! every call is a no-op.

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Metric names as constants for consistency
pub mod names {
    pub const TRACKER_CHANGES_TOTAL: &str = "change_tracker_changes_total";
    pub const TRACKER_DECODE_ERRORS_TOTAL: &str = "change_tracker_decode_errors_total";
    pub const TRACKER_ERRORS_TOTAL: &str = "change_tracker_errors_total";
    pub const TRACKER_HEARTBEATS_TOTAL: &str = "change_tracker_heartbeats_total";
    pub const TRACKER_AUTH_CHALLENGES_TOTAL: &str = "change_tracker_auth_challenges_total";
    pub const TRACKER_BACKOFF_DELAY: &str = "change_tracker_backoff_delay_seconds";
    pub const TRACKER_ATTEMPT_DURATION: &str = "change_tracker_attempt_duration_seconds";

    pub const CONNECTION_STATE: &str = "connection_state";
    pub const CONNECTION_RECONNECTS: &str = "connection_reconnects_total";
}

/// Labels for metrics
pub mod labels {
    pub const TRACKER: &str = "tracker";
    pub const MODE: &str = "mode";
    pub const ERROR_TYPE: &str = "error_type";
    pub const SCHEME: &str = "scheme";
    pub const CONNECTION: &str = "connection";
}

/// Per-session tracker metrics
#[derive(Clone)]
pub struct TrackerMetrics {
    tracker: String,
}

impl TrackerMetrics {
    pub fn new(tracker: impl Into<String>) -> Self {
        Self {
            tracker: tracker.into(),
        }
    }

    /// Record a delivered change
    pub fn record_change(&self, mode: &str) {
        counter!(
            names::TRACKER_CHANGES_TOTAL,
            labels::TRACKER => self.tracker.clone(),
            labels::MODE => mode.to_string(),
        )
        .increment(1);
    }

    /// Record a skipped record
    pub fn record_decode_error(&self) {
        counter!(
            names::TRACKER_DECODE_ERRORS_TOTAL,
            labels::TRACKER => self.tracker.clone(),
        )
        .increment(1);
    }

    /// Record an attempt-ending error
    pub fn record_error(&self, error_type: &str) {
        counter!(
            names::TRACKER_ERRORS_TOTAL,
            labels::TRACKER => self.tracker.clone(),
            labels::ERROR_TYPE => error_type.to_string(),
        )
        .increment(1);
    }

    pub fn record_heartbeat(&self) {
        counter!(
            names::TRACKER_HEARTBEATS_TOTAL,
            labels::TRACKER => self.tracker.clone(),
        )
        .increment(1);
    }

    /// Record an answered authentication challenge
    pub fn record_auth_challenge(&self, scheme: &str) {
        counter!(
            names::TRACKER_AUTH_CHALLENGES_TOTAL,
            labels::TRACKER => self.tracker.clone(),
            labels::SCHEME => scheme.to_string(),
        )
        .increment(1);
    }

    /// Record the delay chosen before a reconnect
    pub fn record_backoff(&self, delay: Duration) {
        histogram!(
            names::TRACKER_BACKOFF_DELAY,
            labels::TRACKER => self.tracker.clone(),
        )
        .record(delay.as_secs_f64());
    }

    /// Record how long a connection attempt lived
    pub fn record_attempt_duration(&self, duration: Duration) {
        histogram!(
            names::TRACKER_ATTEMPT_DURATION,
            labels::TRACKER => self.tracker.clone(),
        )
        .record(duration.as_secs_f64());
    }
}

/// Connection metrics
#[derive(Clone)]
pub struct ConnectionMetrics {
    connection_name: String,
}

impl ConnectionMetrics {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            connection_name: name.into(),
        }
    }

    /// Set connection state (1 = streaming, 0 = not streaming)
    pub fn set_connected(&self, connected: bool) {
        gauge!(
            names::CONNECTION_STATE,
            labels::CONNECTION => self.connection_name.clone(),
        )
        .set(if connected { 1.0 } else { 0.0 });
    }

    /// Record reconnection
    pub fn record_reconnect(&self) {
        counter!(
            names::CONNECTION_RECONNECTS,
            labels::CONNECTION => self.connection_name.clone(),
        )
        .increment(1);
    }
}

/// Reports how long it was alive when dropped or stopped
///
/// Held for the lifetime of a connection attempt so every exit path,
/// including cancellation, records a duration.
pub struct LatencyTimer<F: FnOnce(Duration)> {
    started: Instant,
    report: Option<F>,
}

impl<F: FnOnce(Duration)> LatencyTimer<F> {
    pub fn start(report: F) -> Self {
        Self {
            started: Instant::now(),
            report: Some(report),
        }
    }

    /// Report now instead of on drop
    pub fn stop(mut self) -> Duration {
        let elapsed = self.started.elapsed();
        if let Some(report) = self.report.take() {
            report(elapsed);
        }
        elapsed
    }
}

impl<F: FnOnce(Duration)> Drop for LatencyTimer<F> {
    fn drop(&mut self) {
        if let Some(report) = self.report.take() {
            report(self.started.elapsed());
        }
    }
}
