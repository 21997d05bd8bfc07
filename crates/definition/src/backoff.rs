//! Retry backoff policies.

use std::time::Duration;

/// Delay strategy applied between retries of a failed step attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackoffPolicy {
    /// Retry immediately with no delay.
    None,

    /// Wait the same interval before every retry.
    Fixed(Duration),

    /// Multiply the delay after each attempt, capped at `max`.
    Exponential {
        initial: Duration,
        multiplier: f64,
        max: Duration,
    },
}

impl BackoffPolicy {
    /// A conservative default: 100ms doubling up to 5s.
    pub fn default_exponential() -> Self {
        BackoffPolicy::Exponential {
            initial: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_secs(5),
        }
    }

    /// Returns the delay to wait before retry number `attempt`.
    ///
    /// `attempt` is 1-based: the delay before the first retry is
    /// `delay_for(1)`. Pure; the executor does the actual sleeping.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            BackoffPolicy::None => Duration::ZERO,
            BackoffPolicy::Fixed(delay) => delay,
            BackoffPolicy::Exponential {
                initial,
                multiplier,
                max,
            } => {
                let factor = multiplier.powi(attempt.saturating_sub(1) as i32);
                let delay = initial.mul_f64(factor);
                delay.min(max)
            }
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::default_exponential()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_has_zero_delay() {
        assert_eq!(BackoffPolicy::None.delay_for(1), Duration::ZERO);
        assert_eq!(BackoffPolicy::None.delay_for(10), Duration::ZERO);
    }

    #[test]
    fn fixed_is_constant() {
        let policy = BackoffPolicy::Fixed(Duration::from_millis(250));
        assert_eq!(policy.delay_for(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for(7), Duration::from_millis(250));
    }

    #[test]
    fn exponential_doubles_and_caps() {
        let policy = BackoffPolicy::Exponential {
            initial: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        // Capped from here on.
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(9), Duration::from_millis(500));
    }

    #[test]
    fn default_is_exponential() {
        match BackoffPolicy::default() {
            BackoffPolicy::Exponential { initial, .. } => {
                assert_eq!(initial, Duration::from_millis(100));
            }
            other => panic!("unexpected default policy: {other:?}"),
        }
    }
}
