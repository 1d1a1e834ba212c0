//! Retry policies: decide whether a failed record gets another attempt and
//! how long to wait before it.

use std::time::Duration;

use rand::Rng;

/// A pluggable retry decision for outbox record failures.
///
/// Implementations are expected to be cheap and side-effect free; the
/// scheduler calls `should_retry` and `next_delay` synchronously on the hot
/// path of per-key processing.
pub trait RetryPolicy: Send + Sync {
    /// Whether a record that has failed `failure_count` times (after this
    /// latest failure) should be retried at all, given the error's message.
    /// The default implementation always allows retry; policies that filter
    /// by error kind override this.
    fn should_retry(&self, _error: &str) -> bool {
        true
    }

    /// Delay to apply before the `(retry_count + 1)`-th attempt, where
    /// `retry_count` is the record's `failure_count` after this failure.
    fn next_delay(&self, retry_count: u32) -> Duration;

    /// Number of failures after which a record is marked `FAILED`
    /// regardless of `should_retry`.
    fn max_retries(&self) -> u32;
}

/// Constant delay between attempts.
#[derive(Debug, Clone, Copy)]
pub struct FixedRetryPolicy {
    pub delay: Duration,
    pub max_retries: u32,
}

impl RetryPolicy for FixedRetryPolicy {
    fn next_delay(&self, _retry_count: u32) -> Duration {
        self.delay
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

/// `delay = min(initial_delay * multiplier^(n-1), max_delay)`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoffRetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_retries: u32,
}

impl RetryPolicy for ExponentialBackoffRetryPolicy {
    fn next_delay(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return self.initial_delay.min(self.max_delay);
        }
        let exponent = (retry_count - 1) as i32;
        let factor = self.multiplier.powi(exponent);
        let scaled = self.initial_delay.as_secs_f64() * factor;
        let capped = scaled.min(self.max_delay.as_secs_f64()).max(0.0);
        Duration::from_secs_f64(capped)
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

/// Wraps a base policy and adds `uniform(0, jitter)` to its computed delay,
/// spreading out retries from instances that failed at the same instant.
pub struct JitteredRetryPolicy {
    pub base: Box<dyn RetryPolicy>,
    pub jitter: Duration,
}

impl RetryPolicy for JitteredRetryPolicy {
    fn should_retry(&self, error: &str) -> bool {
        self.base.should_retry(error)
    }

    fn next_delay(&self, retry_count: u32) -> Duration {
        let base_delay = self.base.next_delay(retry_count);
        if self.jitter.is_zero() {
            return base_delay;
        }
        let extra = rand::rng().random_range(0.0..=self.jitter.as_secs_f64());
        base_delay + Duration::from_secs_f64(extra)
    }

    fn max_retries(&self) -> u32 {
        self.base.max_retries()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_policy_always_returns_same_delay() {
        let policy = FixedRetryPolicy { delay: Duration::from_secs(5), max_retries: 3 };
        assert_eq!(policy.next_delay(1), Duration::from_secs(5));
        assert_eq!(policy.next_delay(10), Duration::from_secs(5));
    }

    #[test]
    fn exponential_policy_doubles_and_caps() {
        let policy = ExponentialBackoffRetryPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            max_retries: 10,
        };
        assert_eq!(policy.next_delay(1), Duration::from_secs(1));
        assert_eq!(policy.next_delay(2), Duration::from_secs(2));
        assert_eq!(policy.next_delay(3), Duration::from_secs(4));
        assert_eq!(policy.next_delay(4), Duration::from_secs(8));
        assert_eq!(policy.next_delay(5), Duration::from_secs(10)); // capped
    }

    #[test]
    fn jittered_policy_adds_bounded_extra_delay() {
        let policy = JitteredRetryPolicy {
            base: Box::new(FixedRetryPolicy { delay: Duration::from_secs(1), max_retries: 3 }),
            jitter: Duration::from_millis(500),
        };
        for retry_count in 1..5 {
            let delay = policy.next_delay(retry_count);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_secs(1) + Duration::from_millis(500));
        }
    }

    #[test]
    fn jittered_policy_with_zero_jitter_is_exact_passthrough() {
        let policy = JitteredRetryPolicy {
            base: Box::new(FixedRetryPolicy { delay: Duration::from_secs(2), max_retries: 3 }),
            jitter: Duration::ZERO,
        };
        assert_eq!(policy.next_delay(1), Duration::from_secs(2));
    }

    #[test]
    fn jittered_policy_delegates_max_retries_and_should_retry() {
        let policy = JitteredRetryPolicy {
            base: Box::new(FixedRetryPolicy { delay: Duration::from_secs(1), max_retries: 7 }),
            jitter: Duration::from_millis(10),
        };
        assert_eq!(policy.max_retries(), 7);
        assert!(policy.should_retry("anything"));
    }

    proptest::proptest! {
        #[test]
        fn proptest_exponential_never_exceeds_max_delay(retry_count in 1u32..50) {
            let policy = ExponentialBackoffRetryPolicy {
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(60),
                multiplier: 2.0,
                max_retries: 100,
            };
            let delay = policy.next_delay(retry_count);
            proptest::prop_assert!(delay <= Duration::from_secs(60));
        }
    }
}
