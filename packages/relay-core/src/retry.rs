//! Exponential backoff with down-jitter.
//!
//! - `delay(n) = min(base * 2^(n-1), max) * j`, `j` in `[1 - jitter, 1]`
//! - `n` is the 1-based number of the attempt that just failed

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    /// Fraction of the delay that may be shaved off at random.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Delay after failed attempt `attempt`, with `sample` in `[0, 1)`
    /// selecting the jitter.
    #[must_use]
    pub fn delay_with(&self, attempt: u32, sample: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as i32;
        let base = self.base_delay.as_secs_f64() * 2.0_f64.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jitter = 1.0 - sample.clamp(0.0, 1.0) * self.jitter.clamp(0.0, 1.0);
        Duration::from_secs_f64(capped * jitter)
    }

    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, rand::random::<f64>())
    }

    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
