//! Retry backoff shared by the change watcher and the event publisher.
//!
//! Exponential growth from `base` capped at `cap`, with full jitter: each
//! delay is drawn uniformly from `[0, min(cap, base * 2^attempt)]`.

use std::time::Duration;

use rand::Rng;

/// Backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay ceiling for the first retry.
    pub base: Duration,
    /// Upper bound for any single delay.
    pub cap: Duration,
    /// Give up after this many consecutive failures (`None` = retry forever).
    pub max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl BackoffPolicy {
    /// Unbounded policy with the given base and cap.
    #[must_use]
    pub const fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            max_attempts: None,
        }
    }

    /// Caps the number of delays handed out; `None` after that.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Upper bound of the jitter window for `attempt` (0-based).
    #[must_use]
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Jittered delay for `attempt` (0-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling_ms = u64::try_from(self.ceiling(attempt).as_millis()).unwrap_or(u64::MAX);
        if ceiling_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling_ms))
    }

    /// Starts a fresh retry sequence.
    #[must_use]
    pub const fn start(&self) -> Backoff {
        Backoff {
            policy: *self,
            attempt: 0,
        }
    }
}

/// Stateful retry sequence produced by [`BackoffPolicy::start`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    /// Delay before the next retry, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.policy.max_attempts {
            if self.attempt >= max {
                return None;
            }
        }
        let delay = self.policy.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }

    /// Consecutive failures so far.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Call after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_contract() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.base, Duration::from_millis(500));
        assert_eq!(policy.cap, Duration::from_secs(30));
        assert!(policy.max_attempts.is_none());
    }

    #[test]
    fn test_ceiling_grows_then_caps() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.ceiling(0), Duration::from_millis(500));
        assert_eq!(policy.ceiling(1), Duration::from_secs(1));
        assert_eq!(policy.ceiling(3), Duration::from_secs(4));
        assert_eq!(policy.ceiling(6), Duration::from_secs(30));
        assert_eq!(policy.ceiling(40), Duration::from_secs(30));
    }

    #[test]
    fn test_delay_within_jitter_window() {
        let policy = BackoffPolicy::default();
        for attempt in 0..10 {
            for _ in 0..50 {
                assert!(policy.delay(attempt) <= policy.ceiling(attempt));
            }
        }
    }

    #[test]
    fn test_max_attempts_exhausts() {
        let mut backoff = BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(4))
            .with_max_attempts(2)
            .start();
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert!(backoff.next_delay().is_some());
    }

    #[test]
    fn test_zero_base_never_sleeps() {
        let policy = BackoffPolicy::new(Duration::ZERO, Duration::ZERO);
        assert_eq!(policy.delay(5), Duration::ZERO);
    }
}
