//! Backoff policy: decides retry delays.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Lower bound for a configured backoff delay.
pub const MIN_BACKOFF: Duration = Duration::from_secs(10);

/// Upper bound for both the configured delay and any computed backoff.
pub const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60 * 60);

pub const DEFAULT_BACKOFF_DELAY: Duration = Duration::from_secs(30);

/// Shortest allowed periodic interval.
pub const MIN_PERIODIC_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Shortest allowed periodic flex window.
pub const MIN_PERIODIC_FLEX: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffPolicy {
    Linear,
    #[default]
    Exponential,
}

impl BackoffPolicy {
    /// Calculate the delay before the next attempt.
    ///
    /// # Arguments
    /// * `base` - Configured backoff delay.
    /// * `attempts` - Number of attempts already made (1-indexed).
    ///
    /// Linear: `base * attempts`, Exponential: `base * 2^(attempts - 1)`.
    /// Both are capped at [`MAX_BACKOFF`]. `attempts = 0` behaves like 1.
    ///
    /// Example with base=10s:
    /// - Linear: 10s, 20s, 30s, ...
    /// - Exponential: 10s, 20s, 40s, 80s, ...
    pub fn delay(self, base: Duration, attempts: u32) -> Duration {
        let attempts = attempts.max(1);
        let delay = match self {
            BackoffPolicy::Linear => base.checked_mul(attempts),
            BackoffPolicy::Exponential => {
                let exp = attempts - 1;
                2u32.checked_pow(exp).and_then(|factor| base.checked_mul(factor))
            }
        };
        delay.map_or(MAX_BACKOFF, |d| d.min(MAX_BACKOFF))
    }
}

/// Clamp a requested backoff delay into `[MIN_BACKOFF, MAX_BACKOFF]`.
pub fn clamp_backoff_delay(delay: Duration) -> Duration {
    delay.clamp(MIN_BACKOFF, MAX_BACKOFF)
}
