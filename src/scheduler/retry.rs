// src/scheduler/retry.rs

use std::time::Duration;

/// Delay between a failed attempt and the next one.
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    Fixed(Duration),
    /// `initial * multiplier^(attempt - 1)`, capped at `max`.
    Exponential {
        initial: Duration,
        multiplier: f64,
        max: Duration,
    },
}

/// Per-step retry budget. Attempts are numbered from 1, so a policy with
/// `max_retries = 2` allows three attempts in total.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: Backoff::Fixed(Duration::ZERO),
        }
    }

    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Fixed(delay),
        }
    }

    pub fn exponential(max_retries: u32, initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Exponential {
                initial,
                multiplier,
                max,
            },
        }
    }

    /// Whether a retryable failure of `attempt` gets another try.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }

    /// Delay to wait after `attempt` failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match &self.backoff {
            Backoff::Fixed(d) => *d,
            Backoff::Exponential {
                initial,
                multiplier,
                max,
            } => {
                let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let secs = initial.as_secs_f64() * multiplier.powi(exp);
                if !secs.is_finite() || secs >= max.as_secs_f64() {
                    *max
                } else {
                    Duration::from_secs_f64(secs)
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if let Backoff::Exponential {
            initial,
            multiplier,
            max,
        } = &self.backoff
        {
            if !multiplier.is_finite() || *multiplier < 1.0 {
                return Err(format!("backoff multiplier must be >= 1.0 (got {multiplier})"));
            }
            if initial > max {
                return Err(format!(
                    "initial backoff ({initial:?}) must not exceed max backoff ({max:?})"
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempts_are_numbered_from_one() {
        let policy = RetryPolicy::fixed(2, Duration::from_millis(5));
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::none().should_retry(1));
    }

    #[test]
    fn exponential_backoff_grows_and_caps() {
        let policy = RetryPolicy::exponential(
            10,
            Duration::from_millis(100),
            2.0,
            Duration::from_millis(500),
        );
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(60), Duration::from_millis(500));
    }

    #[test]
    fn validate_rejects_shrinking_backoff() {
        let bad = RetryPolicy::exponential(1, Duration::from_millis(10), 0.5, Duration::from_secs(1));
        assert!(bad.validate().is_err());
        let inverted =
            RetryPolicy::exponential(1, Duration::from_secs(2), 2.0, Duration::from_secs(1));
        assert!(inverted.validate().is_err());
        assert!(RetryPolicy::fixed(3, Duration::from_secs(1)).validate().is_ok());
    }
}
