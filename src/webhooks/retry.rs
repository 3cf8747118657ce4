//! Webhook delivery retry policies.
//!
//! Retry policies are client-configurable per webhook, so every field is
//! range-checked once at the subscription boundary; past that point the rest
//! of the delivery engine can trust the values.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Legal range for `max_attempts`.
const MAX_ATTEMPTS_RANGE: std::ops::RangeInclusive<u32> = 1..=10;
/// Legal range for `initial_delay_ms`.
const INITIAL_DELAY_RANGE: std::ops::RangeInclusive<u64> = 100..=10_000;
/// Legal range for `backoff_multiplier`.
const MULTIPLIER_RANGE: std::ops::RangeInclusive<f64> = 1.0..=5.0;
/// Legal range for `max_delay_ms`.
const MAX_DELAY_RANGE: std::ops::RangeInclusive<u64> = 1_000..=60_000;

/// A validation failure in a client-supplied retry policy.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidRetryPolicy {
    #[error("max_attempts must be between 1 and 10, got {0}")]
    MaxAttempts(u32),

    #[error("initial_delay_ms must be between 100 and 10000, got {0}")]
    InitialDelay(u64),

    #[error("backoff_multiplier must be between 1 and 5, got {0}")]
    Multiplier(f64),

    #[error("max_delay_ms must be between 1000 and 60000, got {0}")]
    MaxDelay(u64),
}

/// Per-webhook delivery retry configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WebhookRetryPolicy {
    /// Total delivery attempts, including the first.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub initial_delay_ms: u64,

    /// Exponential growth factor between retries.
    pub backoff_multiplier: f64,

    /// Cap on the delay between retries.
    pub max_delay_ms: u64,
}

impl Default for WebhookRetryPolicy {
    fn default() -> Self {
        WebhookRetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_delay_ms: 10_000,
        }
    }
}

impl WebhookRetryPolicy {
    /// Range-checks every field. Called once when a subscription is created
    /// or updated.
    pub fn validate(&self) -> Result<(), InvalidRetryPolicy> {
        if !MAX_ATTEMPTS_RANGE.contains(&self.max_attempts) {
            return Err(InvalidRetryPolicy::MaxAttempts(self.max_attempts));
        }
        if !INITIAL_DELAY_RANGE.contains(&self.initial_delay_ms) {
            return Err(InvalidRetryPolicy::InitialDelay(self.initial_delay_ms));
        }
        if !MULTIPLIER_RANGE.contains(&self.backoff_multiplier) {
            return Err(InvalidRetryPolicy::Multiplier(self.backoff_multiplier));
        }
        if !MAX_DELAY_RANGE.contains(&self.max_delay_ms) {
            return Err(InvalidRetryPolicy::MaxDelay(self.max_delay_ms));
        }
        Ok(())
    }

    /// Computes the delay scheduled after the given failed attempt
    /// (0-indexed): `min(initial * multiplier^attempt, max_delay)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt as i32);
        let delay_ms = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(delay_ms as u64)
    }
}
