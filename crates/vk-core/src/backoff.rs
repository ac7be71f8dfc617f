//! Poll interval backoff.
//!
//! A cycle in which any project failed doubles the interval (capped at the
//! maximum); a fully successful cycle drops straight back to the base interval.

use std::time::Duration;

/// Interval after `consecutive_errors` failing cycles in a row:
/// `min(base × 2^(errors−1), max)`, or `base` when there were no errors.
pub fn calculate_backoff(consecutive_errors: u32, base: Duration, max: Duration) -> Duration {
    if consecutive_errors == 0 {
        return base;
    }
    let factor = 2u32
        .checked_pow(consecutive_errors - 1)
        .unwrap_or(u32::MAX);
    base.checked_mul(factor).map_or(max, |d| d.min(max))
}

/// Backoff state for the status poller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollBackoff {
    base: Duration,
    max: Duration,
    consecutive_errors: u32,
    current: Duration,
}

impl PollBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            consecutive_errors: 0,
            current: base,
        }
    }

    /// Record the outcome of a cycle and return the interval to wait before
    /// the next one.
    pub fn record_cycle(&mut self, had_failure: bool) -> Duration {
        if had_failure {
            self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        } else {
            self.consecutive_errors = 0;
        }
        self.current = calculate_backoff(self.consecutive_errors, self.base, self.max);
        self.current
    }

    pub fn reset(&mut self) {
        self.consecutive_errors = 0;
        self.current = self.base;
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }
}
