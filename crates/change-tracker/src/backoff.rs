//! Reconnect backoff for the change tracker

use changes_core::BackoffConfig;
use std::time::Duration;

/// Exponential backoff with a ceiling and an optional retry cap
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    failures: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Delay before retry number `failures` (1-based)
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(failures - 1).unwrap_or(i32::MAX);
        let secs = self.config.initial_delay.as_secs_f64() * self.config.multiplier.powi(exponent);
        let capped = secs.min(self.config.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Count a failed attempt and return how long to wait
    ///
    /// Returns `None` once the retry cap is exceeded.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if let Some(max) = self.config.max_retries {
            if self.failures > max {
                return None;
            }
        }
        Some(self.delay(self.failures))
    }

    /// Back to the initial delay
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Consecutive failures since the last reset
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Whether an attempt did enough to reset the counter
    pub fn is_healthy(&self, delivered: usize, lifetime: Duration) -> bool {
        delivered > 0 || lifetime >= self.config.healthy_after
    }
}
