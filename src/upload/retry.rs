//! Delay schedule between upload attempts.

use std::time::Duration;

use crate::config::{BackoffKind, TelemetryConfig};

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// The base delay before every retry.
    Fixed,

    /// `base * multiplier^(retry - 1)`, capped at `max_delay`.
    Exponential { multiplier: f64, max_delay: Duration },
}

/// Retry budget and delay schedule for one upload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; an upload makes at most
    /// `max_retries + 1` attempts.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// A policy with a constant delay between attempts.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            backoff: Backoff::Fixed,
        }
    }

    /// A policy with exponentially growing delays.
    pub fn exponential(
        max_retries: u32,
        base_delay: Duration,
        multiplier: f64,
        max_delay: Duration,
    ) -> Self {
        Self {
            max_retries,
            base_delay,
            backoff: Backoff::Exponential {
                multiplier,
                max_delay,
            },
        }
    }

    pub fn from_config(config: &TelemetryConfig) -> Self {
        match config.retry_backoff {
            BackoffKind::Fixed => Self::fixed(config.max_retries, config.retry_delay()),
            BackoffKind::Exponential => Self::exponential(
                config.max_retries,
                config.retry_delay(),
                config.retry_backoff_multiplier,
                config.max_retry_delay(),
            ),
        }
    }

    /// Total attempts this policy allows.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Longest one upload can take under this policy: every attempt runs
    /// into `attempt_timeout` and every backoff delay is slept in full.
    pub fn worst_case(&self, attempt_timeout: Duration) -> Duration {
        let attempts = attempt_timeout.saturating_mul(self.max_attempts());
        (1..=self.max_retries)
            .map(|retry| self.delay_for(retry))
            .fold(attempts, Duration::saturating_add)
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential {
                multiplier,
                max_delay,
            } => {
                let exponent = retry.saturating_sub(1).min(63) as i32;
                let factor = multiplier.max(1.0).powi(exponent);
                let millis = self.base_delay.as_millis() as f64 * factor;
                let capped = millis.min(max_delay.as_millis() as f64);
                if capped.is_finite() && capped >= 0.0 {
                    Duration::from_millis(capped as u64)
                } else {
                    max_delay
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(
            3,
            Duration::from_secs(1),
            2.0,
            Duration::from_secs(30),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_delay_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(250));
        assert_eq!(policy.delay_for(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for(3), Duration::from_millis(250));
        assert_eq!(policy.max_attempts(), 4);
    }

    #[test]
    fn test_exponential_delay_grows_and_caps() {
        let policy = RetryPolicy::exponential(
            10,
            Duration::from_millis(100),
            2.0,
            Duration::from_millis(1000),
        );
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(60), Duration::from_millis(1000));
    }

    #[test]
    fn test_worst_case_counts_attempts_and_delays() {
        let policy = RetryPolicy::exponential(
            3,
            Duration::from_secs(1),
            2.0,
            Duration::from_secs(30),
        );
        // 4 attempts of 10s, then 1s + 2s + 4s of backoff.
        assert_eq!(policy.worst_case(Duration::from_secs(10)), Duration::from_secs(47));

        let once = RetryPolicy::fixed(0, Duration::from_secs(5));
        assert_eq!(once.worst_case(Duration::from_secs(10)), Duration::from_secs(10));
    }

    #[test]
    fn test_from_config() {
        let mut config = TelemetryConfig::new("key", "proj", "https://example.com");
        config.retry_backoff = BackoffKind::Fixed;
        config.max_retries = 5;
        config.retry_delay_ms = 10;

        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy, RetryPolicy::fixed(5, Duration::from_millis(10)));
    }
}
