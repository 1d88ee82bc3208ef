//! Exponential backoff policy for outbox dispatch failures.

use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failed attempts after which an entry is abandoned.
    pub max_retries: u32,
    /// Base delay. Attempt `r` waits `initial_delay * 2^r`.
    pub initial_delay: Duration,
    /// Cap for exponential growth.
    pub max_delay: Duration,
}

/// What to do with an entry after a failed dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Keep pending and try again after `delay`.
    Retry { retry_count: u32, delay: Duration },
    /// Give up; the entry becomes failed.
    Fail { retry_count: u32 },
}

impl RetryDecision {
    pub fn retry_count(&self) -> u32 {
        match self {
            RetryDecision::Retry { retry_count, .. } | RetryDecision::Fail { retry_count } => {
                *retry_count
            }
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60 * 60),
        }
    }

    /// Set initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Calculate delay for a given retry count.
    pub fn delay_for_attempt(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    /// Decide the next state of an entry whose dispatch just failed.
    ///
    /// The retry count always increases. Non-retryable failures and failures
    /// that reach the ceiling end in [`RetryDecision::Fail`].
    pub fn decide(&self, previous_retry_count: u32, retryable: bool) -> RetryDecision {
        let retry_count = previous_retry_count.saturating_add(1);
        if !retryable || retry_count >= self.max_retries {
            RetryDecision::Fail { retry_count }
        } else {
            RetryDecision::Retry {
                retry_count,
                delay: self.delay_for_attempt(retry_count),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_delay_calculation() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(20));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(80));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(160));
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = RetryPolicy::new(50).with_max_delay(Duration::from_secs(600));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(600));
    }

    #[test]
    fn test_first_failure_schedules_ten_seconds() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(0, true),
            RetryDecision::Retry {
                retry_count: 1,
                delay: Duration::from_secs(10)
            }
        );
    }

    #[test]
    fn test_fifth_failure_hits_ceiling() {
        let policy = RetryPolicy::default();
        assert!(matches!(policy.decide(3, true), RetryDecision::Retry { .. }));
        assert_eq!(policy.decide(4, true), RetryDecision::Fail { retry_count: 5 });
    }

    #[test]
    fn test_non_retryable_fails_immediately() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.decide(0, false), RetryDecision::Fail { retry_count: 1 });
    }

    #[test]
    fn test_reset_entry_gets_one_more_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.decide(5, true).retry_count(), 6);
        assert!(matches!(policy.decide(5, true), RetryDecision::Fail { .. }));
    }

    proptest! {
        #[test]
        fn prop_backoff_is_strictly_increasing(r in 1u32..5) {
            let policy = RetryPolicy::default();
            prop_assert!(policy.delay_for_attempt(r + 1) > policy.delay_for_attempt(r));
            prop_assert_eq!(
                policy.delay_for_attempt(r),
                Duration::from_millis(5000 * 2u64.pow(r))
            );
        }

        #[test]
        fn prop_backoff_never_decreases(a in 0u32..64, b in 0u32..64) {
            let policy = RetryPolicy::new(64);
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(policy.delay_for_attempt(lo) <= policy.delay_for_attempt(hi));
        }
    }
}
