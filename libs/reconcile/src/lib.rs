//! Reconciliation loop primitives.
//!
//! This library provides the small, platform-independent pieces shared by
//! the provisioner's control loops:
//!
//! - **Outcome**: what a single reconciliation pass asks of its trigger
//!   mechanism (nothing more to do, or come back after a bounded delay).
//! - **Poll gating**: a rate limiter that turns a frequently-invoked tick
//!   into at most one real invocation per interval.
//! - **Failure streaks**: consecutive-failure counting for log escalation.
//!
//! # Invariants
//!
//! - A pass that needs to wait never blocks; it returns a requeue hint
//! - The poll gate advances only when it grants an invocation
//! - Decisions are deterministic given the same inputs (time is injected)

use std::time::{Duration, Instant};

/// Result of one reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing left to do until the object changes.
    Done,

    /// External progress is pending; evaluate again after the delay.
    RequeueAfter(Duration),
}

impl Outcome {
    /// The requested reschedule delay, if any.
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Self::Done => None,
            Self::RequeueAfter(after) => Some(*after),
        }
    }
}

/// Rate limiter for periodic work driven by an external cadence.
///
/// The caller may call [`PollGate::try_acquire`] as often as it likes; the
/// gate grants at most one acquisition per `interval`. The first call is
/// always granted.
#[derive(Debug, Clone)]
pub struct PollGate {
    /// Minimum spacing between granted acquisitions.
    interval: Duration,

    /// Instant of the last granted acquisition.
    last: Option<Instant>,
}

impl PollGate {
    /// Create a gate that has never fired.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Try to acquire the gate at `now`.
    ///
    /// Returns true and records `now` when at least `interval` has elapsed
    /// since the last granted acquisition. Denied attempts leave the gate
    /// untouched.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last {
            if now.saturating_duration_since(last) < self.interval {
                return false;
            }
        }

        self.last = Some(now);
        true
    }

    /// Configured interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

/// Consecutive failure counter for a recurring operation.
///
/// Used to keep the first few failures quiet (`warn`) and escalate once the
/// streak crosses `threshold`.
#[derive(Debug, Clone)]
pub struct FailureStreak {
    threshold: u32,
    count: u32,
}

impl FailureStreak {
    /// Create a streak that escalates after `threshold` consecutive failures.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            count: 0,
        }
    }

    /// Record a failure and return the current streak length.
    pub fn record_failure(&mut self) -> u32 {
        self.count = self.count.saturating_add(1);
        self.count
    }

    /// Reset after a success.
    pub fn reset(&mut self) {
        self.count = 0;
    }

    /// Current streak length.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Returns true once the streak is longer than the threshold.
    pub fn is_escalated(&self) -> bool {
        self.count > self.threshold
    }
}

impl Default for FailureStreak {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD)
    }
}

/// Default interval between real backend polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Default delay before re-evaluating an object that is still starting.
pub const DEFAULT_REQUEUE_DELAY: Duration = Duration::from_secs(5);

/// Default backoff applied by the trigger mechanism after a failed pass.
pub const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(15);

/// Default number of quiet failures before escalation.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_outcome_accessors() {
        assert_eq!(Outcome::Done.requeue_after(), None);

        let requeue = Outcome::RequeueAfter(Duration::from_secs(5));
        assert_eq!(requeue.requeue_after(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_poll_gate_first_acquire_granted() {
        let mut gate = PollGate::new(Duration::from_secs(30));
        assert!(gate.last.is_none());

        let now = Instant::now();
        assert!(gate.try_acquire(now));
        assert_eq!(gate.last, Some(now));
    }

    #[rstest]
    #[case(0, false)]
    #[case(1, false)]
    #[case(29, false)]
    #[case(30, true)]
    #[case(31, true)]
    fn test_poll_gate_interval(#[case] elapsed_secs: u64, #[case] granted: bool) {
        let mut gate = PollGate::new(Duration::from_secs(30));
        let start = Instant::now();
        assert!(gate.try_acquire(start));

        let later = start + Duration::from_secs(elapsed_secs);
        assert_eq!(gate.try_acquire(later), granted);
    }

    #[test]
    fn test_poll_gate_denied_does_not_advance() {
        let mut gate = PollGate::new(Duration::from_secs(30));
        let start = Instant::now();
        assert!(gate.try_acquire(start));

        // Denied attempts must not push the window forward
        assert!(!gate.try_acquire(start + Duration::from_secs(20)));
        assert_eq!(gate.last, Some(start));
        assert!(gate.try_acquire(start + Duration::from_secs(30)));
    }

    #[test]
    fn test_poll_gate_clock_going_backwards() {
        let mut gate = PollGate::new(Duration::from_secs(30));
        let start = Instant::now() + Duration::from_secs(60);
        assert!(gate.try_acquire(start));
        assert!(!gate.try_acquire(start - Duration::from_secs(10)));
    }

    #[test]
    fn test_failure_streak() {
        let mut streak = FailureStreak::new(3);

        assert_eq!(streak.record_failure(), 1);
        assert_eq!(streak.record_failure(), 2);
        assert_eq!(streak.record_failure(), 3);
        assert!(!streak.is_escalated());
        assert_eq!(streak.record_failure(), 4);
        assert!(streak.is_escalated());

        streak.reset();
        assert_eq!(streak.count(), 0);
        assert!(!streak.is_escalated());
    }
}
