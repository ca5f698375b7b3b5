//! Bounded restart policy for keep-alive pairing requests.
//!
//! A keep-alive request whose connection drops before linking starts a fresh
//! attempt after an exponential backoff with jitter, up to `max_attempts`.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Restart configuration for a pairing request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, the first one included.
    pub max_attempts: u32,
    /// Base delay for exponential backoff (milliseconds).
    pub base_delay_ms: u64,
    /// Maximum delay cap (milliseconds).
    pub max_delay_ms: u64,
    /// Jitter factor (0.0 to 1.0) - randomness added to delay.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 3_000,
            max_delay_ms: 30_000,
            jitter_factor: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt may follow attempt number `attempt` (1-based).
    pub fn allows_another(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before the restart that follows `failures` consecutive failures.
    ///
    /// Uses `base_delay * 2^(failures - 1)`, capped at `max_delay`, plus
    /// additive jitter of up to `jitter_factor * computed_delay`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1);
        let exp_delay_ms = self
            .base_delay_ms
            .saturating_mul(1u64.checked_shl(exponent).unwrap_or(u64::MAX));
        let capped_delay_ms = exp_delay_ms.min(self.max_delay_ms);

        let jitter_range = (capped_delay_ms as f64 * self.jitter_factor.clamp(0.0, 1.0)) as u64;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(0..=jitter_range)
        } else {
            0
        };

        Duration::from_millis(capped_delay_ms.saturating_add(jitter))
    }
}
