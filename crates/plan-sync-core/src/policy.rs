use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential reconnect policy for the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Consecutive failed attempts tolerated before falling back to polling.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first reconnect.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Exponential multiplier per failed attempt.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Upper bound for computed backoff.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_initial_backoff_ms() -> u64 {
    1_000
}

const fn default_backoff_factor() -> f64 {
    2.0
}

const fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_factor: default_backoff_factor(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl ReconnectPolicy {
    pub fn exponential(max_attempts: u32, initial_backoff_ms: u64, backoff_factor: f64) -> Self {
        let initial = if initial_backoff_ms == 0 {
            default_initial_backoff_ms()
        } else {
            initial_backoff_ms
        };
        let factor = if backoff_factor < 1.0 {
            default_backoff_factor()
        } else {
            backoff_factor
        };
        Self {
            max_attempts,
            initial_backoff_ms: initial,
            backoff_factor: factor,
            max_backoff_ms: default_max_backoff_ms(),
        }
    }

    pub fn with_max_backoff_ms(mut self, max_backoff_ms: u64) -> Self {
        self.max_backoff_ms = max_backoff_ms.max(1);
        self
    }

    /// Whether another attempt is allowed after `failed_attempts` consecutive failures.
    pub fn can_retry(&self, failed_attempts: u32) -> bool {
        failed_attempts < self.max_attempts
    }

    /// Delay before the attempt that follows `failed_attempts` failures (1-based).
    pub fn backoff_duration(&self, failed_attempts: u32) -> Duration {
        let step = failed_attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let exp = self.backoff_factor.powi(step);
        let base = self.initial_backoff_ms as f64 * exp;
        let cap = self.max_backoff_ms.max(1);
        let clamped = if base.is_finite() {
            (base.round() as u64).min(cap)
        } else {
            cap
        };
        Duration::from_millis(clamped)
    }
}
