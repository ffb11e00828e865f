//! Process-wide connection health.
//!
//! Subscription failures are counted as they happen; a periodic check folds
//! them into a consecutive-failure counter. A check interval with at least one
//! failure extends the streak, a clean interval ends it. When the streak
//! reaches the threshold the aggregate turns unhealthy and the caller is told
//! to force-reconnect every subscription, even those whose own state looks fine.

use serde::Serialize;

/// Default number of consecutive failing intervals before a mass reconnect.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Outcome of a periodic health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    /// No failures since the last check.
    Healthy,
    /// Failures observed, threshold not yet reached.
    Degraded {
        /// Consecutive failing intervals so far.
        consecutive_failures: u32,
    },
    /// Threshold reached: reconnect everything.
    ReconnectAll {
        /// Consecutive failing intervals that triggered it.
        consecutive_failures: u32,
    },
}

/// Serializable view of [`ConnectionHealth`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    /// Aggregate health flag.
    pub healthy: bool,
    /// Consecutive failing check intervals.
    pub consecutive_failures: u32,
    /// Failures recorded since the last check.
    pub failures_since_check: u32,
    /// Last check time (ms since epoch).
    pub last_check_ms: Option<u64>,
    /// Mass reconnects triggered so far.
    pub forced_reconnects: u64,
}

/// Aggregate connection health - NO I/O, the caller drives the interval.
#[derive(Debug, Clone)]
pub struct ConnectionHealth {
    threshold: u32,
    healthy: bool,
    consecutive_failures: u32,
    failures_since_check: u32,
    last_check_ms: Option<u64>,
    forced_reconnects: u64,
}

impl ConnectionHealth {
    /// Create a healthy aggregate with the given threshold (minimum 1).
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            healthy: true,
            consecutive_failures: 0,
            failures_since_check: 0,
            last_check_ms: None,
            forced_reconnects: 0,
        }
    }

    /// Record a subscription error transition.
    pub fn record_failure(&mut self) {
        self.failures_since_check = self.failures_since_check.saturating_add(1);
    }

    /// Record a successful `connected` transition.
    ///
    /// Resets the streak. Failures already recorded in the current interval
    /// still count at the next check.
    pub fn record_connected(&mut self) {
        self.healthy = true;
        self.consecutive_failures = 0;
    }

    /// Fold the current interval into the streak.
    pub fn check(&mut self, now_ms: u64) -> HealthVerdict {
        self.last_check_ms = Some(now_ms);

        if self.failures_since_check == 0 {
            self.consecutive_failures = 0;
            self.healthy = true;
            return HealthVerdict::Healthy;
        }

        self.failures_since_check = 0;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        if self.consecutive_failures >= self.threshold {
            let consecutive_failures = self.consecutive_failures;
            self.healthy = false;
            self.consecutive_failures = 0;
            self.forced_reconnects = self.forced_reconnects.saturating_add(1);
            HealthVerdict::ReconnectAll {
                consecutive_failures,
            }
        } else {
            HealthVerdict::Degraded {
                consecutive_failures: self.consecutive_failures,
            }
        }
    }

    /// Aggregate health flag.
    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// Serializable view.
    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            healthy: self.healthy,
            consecutive_failures: self.consecutive_failures,
            failures_since_check: self.failures_since_check,
            last_check_ms: self.last_check_ms,
            forced_reconnects: self.forced_reconnects,
        }
    }

    /// Back to the initial healthy state.
    pub fn reset(&mut self) {
        *self = Self::new(self.threshold);
    }
}

impl Default for ConnectionHealth {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_healthy() {
        let mut health = ConnectionHealth::default();
        assert!(health.is_healthy());
        assert_eq!(health.check(1), HealthVerdict::Healthy);
    }

    #[test]
    fn failing_intervals_reach_threshold() {
        let mut health = ConnectionHealth::new(3);

        health.record_failure();
        assert_eq!(
            health.check(1),
            HealthVerdict::Degraded {
                consecutive_failures: 1
            }
        );
        health.record_failure();
        health.record_failure();
        assert_eq!(
            health.check(2),
            HealthVerdict::Degraded {
                consecutive_failures: 2
            }
        );
        health.record_failure();
        assert_eq!(
            health.check(3),
            HealthVerdict::ReconnectAll {
                consecutive_failures: 3
            }
        );
        assert!(!health.is_healthy());
        assert_eq!(health.snapshot().forced_reconnects, 1);
        assert_eq!(health.snapshot().consecutive_failures, 0);
    }

    #[test]
    fn clean_interval_breaks_streak() {
        let mut health = ConnectionHealth::new(2);
        health.record_failure();
        health.check(1);

        assert_eq!(health.check(2), HealthVerdict::Healthy);

        health.record_failure();
        assert!(matches!(health.check(3), HealthVerdict::Degraded { .. }));
    }

    #[test]
    fn connected_resets_streak_and_health() {
        let mut health = ConnectionHealth::new(1);
        health.record_failure();
        assert!(matches!(health.check(1), HealthVerdict::ReconnectAll { .. }));
        assert!(!health.is_healthy());

        health.record_connected();
        assert!(health.is_healthy());
        assert_eq!(health.snapshot().consecutive_failures, 0);
    }

    #[test]
    fn snapshot_records_last_check() {
        let mut health = ConnectionHealth::default();
        health.check(1234);
        assert_eq!(health.snapshot().last_check_ms, Some(1234));
    }

    #[test]
    fn zero_threshold_clamped_to_one() {
        let mut health = ConnectionHealth::new(0);
        health.record_failure();
        assert!(matches!(health.check(1), HealthVerdict::ReconnectAll { .. }));
    }
}
