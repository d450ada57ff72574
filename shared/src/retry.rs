//! Retry policy shared by session reconnects and process restarts

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff with jitter and an optional attempt cap
///
/// Attempts are numbered from zero. The delay before attempt `n` is
/// `initial * multiplier^n`, capped at `max`, then scaled by a random factor
/// in `[1 - jitter, 1 + jitter]` and capped again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// A constant delay with no jitter and no cap on attempts.
    pub fn fixed(delay: Duration) -> Self {
        let ms = delay.as_millis().min(u64::MAX as u128) as u64;
        Self {
            initial_delay_ms: ms,
            max_delay_ms: ms,
            multiplier: 1.0,
            jitter: 0.0,
            max_attempts: None,
        }
    }

    /// Whether attempt `attempt` may still be made.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt < max)
    }

    /// Delay to wait before attempt `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let max = self.max_delay_ms.max(self.initial_delay_ms) as f64;
        let growth = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let mut delay = (self.initial_delay_ms as f64 * growth).min(max);

        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter > 0.0 && delay > 0.0 {
            let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
            delay = (delay * factor).min(max);
        }

        Duration::from_millis(delay as u64)
    }
}
