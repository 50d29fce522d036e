//! Backoff policy
//!
//! Pure mapping from attempt count to delay. No state lives here; the
//! retry executor owns attempt bookkeeping.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::infrastructure::config::RetrySettings;

/// Exponential backoff with a hard cap and optional jitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// First delay in milliseconds
    pub base_delay_ms: u64,
    /// Delay ceiling in milliseconds
    pub max_delay_ms: u64,
    /// Multiplier applied per completed attempt
    pub backoff_multiplier: f64,
    /// Randomize delays between 50% and 150% of the computed value
    pub enable_jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            enable_jitter: false,
        }
    }
}

impl BackoffPolicy {
    #[must_use]
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            base_delay_ms: settings.base_delay_ms,
            max_delay_ms: settings.max_delay_ms,
            backoff_multiplier: settings.backoff_multiplier,
            enable_jitter: settings.enable_jitter,
        }
    }

    /// Delay before the retry following `attempts` completed failures.
    ///
    /// `attempts = 0` yields the base delay; each further attempt doubles
    /// (with the default multiplier) up to the cap.
    #[must_use]
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponential =
            (self.base_delay_ms as f64 * self.backoff_multiplier.powi(attempts as i32)) as u64;
        let capped = exponential.min(self.max_delay_ms);

        let millis = if self.enable_jitter {
            // 50%-150% of the capped value
            let factor = 0.5 + fastrand::f64();
            (capped as f64 * factor) as u64
        } else {
            capped
        };

        Duration::from_millis(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_schedule_without_jitter() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(4_000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(8_000));
        // capped
        assert_eq!(policy.delay_for(4), Duration::from_millis(10_000));
        assert_eq!(policy.delay_for(10), Duration::from_millis(10_000));
    }

    #[test]
    fn jitter_stays_within_half_to_one_and_a_half() {
        let policy = BackoffPolicy {
            enable_jitter: true,
            ..BackoffPolicy::default()
        };
        for _ in 0..50 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_millis(1_000));
            assert!(delay <= Duration::from_millis(3_000));
        }
    }
}
