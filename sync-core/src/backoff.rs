//! Retry and backoff policy for subscription reconnects.
//!
//! Delays grow geometrically from `base_delay` and are capped at
//! `max_delay` so the worst-case recovery time stays bounded. There is no
//! jitter: consecutive delays for one subscription never decrease.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default cap on any single reconnect delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Per-subscription retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Connection attempts allowed, the first one included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Growth factor applied per consecutive failure.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Upper bound on any delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY.as_millis() as u64
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// What to do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt after `delay`.
    Retry {
        /// Delay before reconnecting.
        delay: Duration,
        /// 1-based number of the retry being scheduled.
        attempt: u32,
    },
    /// Retry budget exhausted; report a permanent failure.
    GiveUp {
        /// Consecutive failures observed.
        failures: u32,
    },
}

impl RetryPolicy {
    /// Create a policy with the default cap.
    pub fn new(max_attempts: u32, base_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts,
            base_delay_ms: base_delay.as_millis() as u64,
            multiplier,
            max_delay_ms: default_max_delay_ms(),
        }
    }

    /// Set the delay cap.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay_ms = max_delay.as_millis() as u64;
        self
    }

    /// Delay before the first retry.
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Delay cap.
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Compute `min(base * multiplier^retry_count, max_delay)`.
    ///
    /// Multipliers below 1.0 are treated as 1.0 so the sequence stays
    /// non-decreasing.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let cap = self.max_delay_ms as f64;
        let factor = self.multiplier.max(1.0).powi(retry_count.min(i32::MAX as u32) as i32);
        let millis = (self.base_delay_ms as f64 * factor).min(cap);
        if millis.is_finite() {
            Duration::from_millis(millis as u64)
        } else {
            self.max_delay()
        }
    }

    /// Decide what follows the `failures`-th consecutive failure (1-based).
    ///
    /// The attempt that just failed counts against `max_attempts`, so the
    /// `max_attempts`-th consecutive failure is terminal.
    pub fn on_failure(&self, failures: u32) -> RetryDecision {
        if failures >= self.max_attempts {
            return RetryDecision::GiveUp { failures };
        }
        RetryDecision::Retry {
            delay: self.delay_for(failures.saturating_sub(1)),
            attempt: failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_retry_uses_base_delay() {
        let policy = RetryPolicy::new(5, Duration::from_millis(500), 2.0);
        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4000));
    }

    #[test]
    fn delay_capped_at_max() {
        let policy = RetryPolicy::new(100, Duration::from_secs(1), 2.0);
        assert_eq!(policy.delay_for(10), DEFAULT_MAX_DELAY);
        assert_eq!(policy.delay_for(u32::MAX), DEFAULT_MAX_DELAY);
    }

    #[test]
    fn delays_are_non_decreasing_up_to_cap() {
        let policy = RetryPolicy::new(50, Duration::from_millis(250), 1.7)
            .with_max_delay(Duration::from_secs(10));
        let delays: Vec<Duration> = (0..40).map(|n| policy.delay_for(n)).collect();

        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1], "{:?} > {:?}", pair[0], pair[1]);
        }
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn shrinking_multiplier_does_not_shrink_delay() {
        let policy = RetryPolicy::new(5, Duration::from_secs(2), 0.5);
        assert_eq!(policy.delay_for(0), policy.delay_for(4));
    }

    #[test]
    fn gives_up_at_max_attempts() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1), 2.0);

        for failures in 1..5 {
            assert!(matches!(
                policy.on_failure(failures),
                RetryDecision::Retry { attempt, .. } if attempt == failures
            ));
        }
        assert_eq!(
            policy.on_failure(5),
            RetryDecision::GiveUp { failures: 5 }
        );
        assert_eq!(
            policy.on_failure(6),
            RetryDecision::GiveUp { failures: 6 }
        );
    }

    #[test]
    fn missing_fields_use_defaults() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"max_attempts": 3}"#).unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay_ms, 1000);
        assert_eq!(policy.max_delay(), DEFAULT_MAX_DELAY);
    }
}
