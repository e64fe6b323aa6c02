//! Per-service health tracking and the backoff trip logic.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::config::ServiceTuning;

/// When to suspend scheduled work after repeated failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Consecutive failures that trip the backoff.
    pub failure_threshold: u32,
    /// How long scheduled ticks are skipped once tripped.
    pub window: Duration,
    /// Move `backoff_until` forward on every failure past the threshold
    /// instead of keeping the first trip's deadline.
    pub extend_on_failure: bool,
}

impl BackoffPolicy {
    pub fn from_tuning(tuning: &ServiceTuning) -> Self {
        Self {
            failure_threshold: tuning.failure_threshold.max(1),
            window: Duration::from_millis(tuning.backoff_window_ms),
            extend_on_failure: tuning.extend_backoff,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_tuning(&ServiceTuning::default())
    }
}

/// Health of one service over its current run.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ServiceHealthState {
    pub consecutive_failures: u32,
    pub backoff_until: Option<Instant>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub total_requests: u64,
}

impl ServiceHealthState {
    /// Whether scheduled work should be skipped at `now`.
    pub fn in_backoff(&self, now: Instant) -> bool {
        self.backoff_until.is_some_and(|until| now < until)
    }

    /// Time left in the backoff window, if any.
    pub fn backoff_remaining(&self, now: Instant) -> Option<Duration> {
        self.backoff_until
            .filter(|until| now < *until)
            .map(|until| until - now)
    }

    /// A successful cycle clears the failure streak and any backoff.
    pub fn record_success(&mut self, at: DateTime<Utc>) {
        self.consecutive_failures = 0;
        self.backoff_until = None;
        self.last_success = Some(at);
        self.last_error = None;
    }

    /// Count a failed cycle. Returns true when this failure set or moved
    /// `backoff_until`.
    pub fn record_failure(&mut self, now: Instant, policy: &BackoffPolicy, error: String) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_error = Some(error);

        let reached = self.consecutive_failures == policy.failure_threshold;
        let past = self.consecutive_failures > policy.failure_threshold;

        if reached || (past && policy.extend_on_failure) {
            self.backoff_until = Some(now + policy.window);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(extend: bool) -> BackoffPolicy {
        BackoffPolicy {
            failure_threshold: 3,
            window: Duration::from_secs(300),
            extend_on_failure: extend,
        }
    }

    #[test]
    fn test_trips_exactly_at_threshold() {
        let mut health = ServiceHealthState::default();
        let now = Instant::now();
        let policy = policy(false);

        assert!(!health.record_failure(now, &policy, "e1".into()));
        assert!(!health.record_failure(now, &policy, "e2".into()));
        assert!(health.backoff_until.is_none());

        assert!(health.record_failure(now, &policy, "e3".into()));
        assert_eq!(health.backoff_until, Some(now + Duration::from_secs(300)));
        assert!(health.in_backoff(now));
        assert!(!health.in_backoff(now + Duration::from_secs(300)));
    }

    #[test]
    fn test_fixed_window_is_not_extended() {
        let mut health = ServiceHealthState::default();
        let start = Instant::now();
        let policy = policy(false);
        for _ in 0..3 {
            health.record_failure(start, &policy, "e".into());
        }
        let later = start + Duration::from_secs(10);
        assert!(!health.record_failure(later, &policy, "e4".into()));
        assert_eq!(health.backoff_until, Some(start + Duration::from_secs(300)));
    }

    #[test]
    fn test_extend_policy_moves_deadline() {
        let mut health = ServiceHealthState::default();
        let start = Instant::now();
        let policy = policy(true);
        for _ in 0..3 {
            health.record_failure(start, &policy, "e".into());
        }
        let later = start + Duration::from_secs(10);
        assert!(health.record_failure(later, &policy, "e4".into()));
        assert_eq!(health.backoff_until, Some(later + Duration::from_secs(300)));
    }

    #[test]
    fn test_success_resets() {
        let mut health = ServiceHealthState::default();
        let now = Instant::now();
        let policy = policy(false);
        for _ in 0..3 {
            health.record_failure(now, &policy, "e".into());
        }
        health.record_success(Utc::now());
        assert_eq!(health.consecutive_failures, 0);
        assert!(health.backoff_until.is_none());
        assert!(health.last_error.is_none());
        assert!(health.last_success.is_some());
    }
}
