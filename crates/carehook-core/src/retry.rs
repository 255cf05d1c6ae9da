//! Retry policy and exponential backoff.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{HookError, Result};

/// Largest jitter factor that keeps consecutive delays non-decreasing.
///
/// With `delay(n) = base * 2^(n-1) * (1 + j*u)` and `u` in [-1, 1], the
/// worst case `delay(n) = base * 2^(n-1) * (1 + j)` stays below the smallest
/// `delay(n + 1) = base * 2^n * (1 - j)` as long as `j <= 1/3`.
pub const MAX_JITTER: f64 = 1.0 / 3.0;

/// Per-subscription retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total number of attempts including the first one.
    pub max_attempts: u32,

    /// Delay after the first failed attempt, in milliseconds.
    pub base_delay_ms: u64,

    /// Cap for any single delay, in milliseconds.
    pub max_delay_ms: u64,

    /// Relative jitter applied to each delay. Clamped to [0, 1/3].
    pub jitter: f64,
}

fn default_jitter() -> f64 {
    0.1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay_ms: 1_000,
            max_delay_ms: 15 * 60 * 1_000,
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: base_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
            jitter: default_jitter(),
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(HookError::validation(
                "retry_policy.max_attempts must be > 0",
            ));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(HookError::validation(
                "retry_policy.max_delay_ms must be >= base_delay_ms",
            ));
        }
        if !self.jitter.is_finite() || self.jitter < 0.0 {
            return Err(HookError::validation(
                "retry_policy.jitter must be a non-negative number",
            ));
        }
        Ok(())
    }

    /// Whether another attempt is allowed after `attempts_made` attempts.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    fn effective_jitter(&self) -> f64 {
        if self.jitter.is_finite() {
            self.jitter.clamp(0.0, MAX_JITTER)
        } else {
            0.0
        }
    }

    /// Delay before the next attempt after the `failed_attempt`-th failure
    /// (1-based), using `unit` in [-1, 1] as the jitter sample.
    pub fn delay_with_sample(&self, failed_attempt: u32, unit: f64) -> Duration {
        let max_ms = self.max_delay_ms as f64;
        let exponent = failed_attempt.saturating_sub(1).min(62) as i32;
        let raw = self.base_delay_ms as f64 * 2_f64.powi(exponent);
        let jittered = raw * (1.0 + self.effective_jitter() * unit.clamp(-1.0, 1.0));
        Duration::from_millis(jittered.min(max_ms).max(0.0) as u64)
    }

    /// Delay before the next attempt with a random jitter sample.
    pub fn next_delay(&self, failed_attempt: u32) -> Duration {
        let unit = if self.effective_jitter() > 0.0 {
            rand::thread_rng().gen_range(-1.0..=1.0)
        } else {
            0.0
        };
        self.delay_with_sample(failed_attempt, unit)
    }
}
