use rand::Rng;
use std::time::Duration;

/// Bounded exponential backoff.
///
/// `max_attempts` counts the first try. The delay before retry `n` (0-based)
/// is `min(base_delay * 2^n, max_delay)`; with `jitter` the delay is drawn
/// uniformly from the upper half of that value.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(20));
        let exp = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if !self.jitter {
            return exp;
        }

        let half_ms = (exp.as_millis() / 2) as u64;
        let mut rng = rand::rng();
        Duration::from_millis(half_ms + rng.random_range(0..=half_ms))
    }

    /// Backoff raised to at least the provider's retry-after hint
    pub fn delay_for(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        let backoff = self.backoff(retry);
        match retry_after {
            Some(hint) => backoff.max(hint),
            None => backoff,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            jitter: false,
        }
    }

    #[test]
    fn test_exponential_growth_is_capped() {
        let policy = fixed();
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(4), Duration::from_millis(1000));
        assert_eq!(policy.backoff(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_in_upper_half() {
        let policy = RetryPolicy {
            jitter: true,
            ..fixed()
        };
        for _ in 0..50 {
            let delay = policy.backoff(2);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(400));
        }
    }

    #[test]
    fn test_retry_after_hint_raises_delay() {
        let policy = fixed();
        assert_eq!(
            policy.delay_for(0, Some(Duration::from_millis(750))),
            Duration::from_millis(750)
        );
        assert_eq!(
            policy.delay_for(2, Some(Duration::from_millis(50))),
            Duration::from_millis(400)
        );
    }
}
