//! Retry policy for analysis attempts.

use std::time::Duration;

use rand::Rng;

use crate::config::AnalysisConfig;

/// Bounds on how often and how patiently a batch is retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt (doubles after each failure)
    pub base_delay: Duration,
    /// Cap on a single delay
    pub max_delay: Duration,
    /// Per-attempt timeout
    pub timeout: Duration,
    /// Randomize each delay within its upper half
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&AnalysisConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            timeout: config.timeout(),
            jitter: true,
        }
    }

    /// Upper bound on the wait after `failed_attempts` failures (1-based).
    pub fn backoff_ceiling(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(31);
        let multiplier = 2u32.saturating_pow(exponent);
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Wait before the next attempt after `failed_attempts` failures.
    ///
    /// With jitter the delay is drawn from `[ceiling / 2, ceiling]`, so
    /// backoff still grows monotonically in expectation.
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let ceiling = self.backoff_ceiling(failed_attempts);
        if !self.jitter {
            return ceiling;
        }

        let ceiling_ms = ceiling.as_millis() as u64;
        let half = ceiling_ms / 2;
        let jittered = half + rand::thread_rng().gen_range(0..=ceiling_ms - half);
        Duration::from_millis(jittered)
    }
}
