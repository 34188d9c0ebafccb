use crate::{QueueError, Result};
use rand::Rng;
use std::time::Duration;

/// Exponential backoff with multiplicative jitter.
///
/// Attempt `n` waits `min(max, base * 2^(n-1)) * (1 + U[0, jitter))`,
/// never more than `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            jitter: 0.1,
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Result<Self> {
        if base > max {
            return Err(QueueError::invalid_backoff(format!(
                "base delay {:?} exceeds maximum {:?}",
                base, max
            )));
        }
        if !(0.0..=1.0).contains(&jitter) {
            return Err(QueueError::invalid_backoff(format!(
                "jitter {} is outside [0, 1]",
                jitter
            )));
        }
        Ok(Self { base, max, jitter })
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay before retry number `attempt` (1-based; 0 counts as 1)
    pub fn delay(&self, attempt: u32) -> Duration {
        let unjittered = self.unjittered(attempt);
        let factor = if self.jitter > 0.0 {
            1.0 + rand::rng().random_range(0.0..self.jitter)
        } else {
            1.0
        };
        unjittered.mul_f64(factor).min(self.max)
    }

    /// Delay without jitter
    pub fn unjittered(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_until_max() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(10), 0.0).unwrap();
        assert_eq!(backoff.delay(0), Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(2));
        assert_eq!(backoff.delay(4), Duration::from_secs(8));
        assert_eq!(backoff.delay(5), Duration::from_secs(10));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 0.5).unwrap();
        for _ in 0..100 {
            let delay = backoff.delay(3);
            assert!(delay >= Duration::from_secs(4));
            assert!(delay < Duration::from_secs(6));
        }
        // Jitter never pushes past the cap
        assert!(backoff.delay(10) <= Duration::from_secs(60));
    }

    #[test]
    fn test_rejects_invalid_settings() {
        assert!(Backoff::new(Duration::from_secs(10), Duration::from_secs(1), 0.1).is_err());
        assert!(Backoff::new(Duration::from_secs(1), Duration::from_secs(10), 1.5).is_err());
    }
}
