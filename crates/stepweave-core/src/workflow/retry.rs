//! Retry decisions and back-off delays for failed step attempts.
//!
//! Stateless: all logic lives in associated functions that take the step's
//! `RetryPolicy` as a parameter.

use std::time::Duration;

use stepweave_types::workflow::{Backoff, RetryPolicy};

/// Stateless retry handler for step failures.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether another attempt is allowed after `attempt` failed.
    ///
    /// `attempt` is 1-based (the first execution is attempt 1), so a policy
    /// with `max_retries = N` allows at most N + 1 attempts. Non-retryable
    /// errors never retry.
    pub fn should_retry(policy: &RetryPolicy, attempt: u32, retryable: bool) -> bool {
        retryable && attempt <= policy.max_retries
    }

    /// Delay to wait before the attempt following `attempt`.
    ///
    /// Fixed back-off always waits `retry_delay_ms`. Exponential back-off
    /// waits `retry_delay_ms * 2^(attempt - 1)`, capped at `max_delay_ms`.
    pub fn delay_for(policy: &RetryPolicy, attempt: u32) -> Duration {
        let base = policy.retry_delay_ms;
        let ms = match policy.backoff {
            Backoff::Fixed => base,
            Backoff::Exponential => {
                let shift = attempt.saturating_sub(1).min(32);
                base.saturating_mul(1u64 << shift)
                    .min(policy.max_delay_ms.max(base))
            }
        };
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_retry_bounds_attempts() {
        let policy = RetryPolicy::fixed(2, 10);
        assert!(RetryHandler::should_retry(&policy, 1, true));
        assert!(RetryHandler::should_retry(&policy, 2, true));
        assert!(!RetryHandler::should_retry(&policy, 3, true), "N+1 attempts max");
    }

    #[test]
    fn test_no_retries_by_default() {
        let policy = RetryPolicy::default();
        assert!(!RetryHandler::should_retry(&policy, 1, true));
    }

    #[test]
    fn test_non_retryable_never_retries() {
        let policy = RetryPolicy::fixed(5, 10);
        assert!(!RetryHandler::should_retry(&policy, 1, false));
    }

    #[test]
    fn test_fixed_delay_constant() {
        let policy = RetryPolicy::fixed(3, 250);
        for attempt in 1..=3 {
            assert_eq!(RetryHandler::delay_for(&policy, attempt), Duration::from_millis(250));
        }
    }

    #[test]
    fn test_exponential_delay_doubles_and_caps() {
        let mut policy = RetryPolicy::exponential(10, 100);
        policy.max_delay_ms = 1_000;
        assert_eq!(RetryHandler::delay_for(&policy, 1), Duration::from_millis(100));
        assert_eq!(RetryHandler::delay_for(&policy, 2), Duration::from_millis(200));
        assert_eq!(RetryHandler::delay_for(&policy, 3), Duration::from_millis(400));
        assert_eq!(RetryHandler::delay_for(&policy, 5), Duration::from_millis(1_000));
        assert_eq!(RetryHandler::delay_for(&policy, 60), Duration::from_millis(1_000));
    }
}
