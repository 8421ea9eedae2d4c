//! Retry policy for failed job attempts.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Delay schedule between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay after every failure.
    Fixed { delay_ms: u64 },
    /// `base_ms * factor^(attempt - 1)`, capped at `max_ms`, spread by `jitter`.
    Exponential {
        base_ms: u64,
        factor: f64,
        max_ms: u64,
        /// Fraction of the delay added or subtracted at random (0.0 - 1.0).
        #[serde(default)]
        jitter: f64,
    },
}

impl Backoff {
    /// Delay before retrying after the given failed attempt (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            Backoff::Exponential {
                base_ms,
                factor,
                max_ms,
                jitter,
            } => {
                let exponent = attempt.saturating_sub(1).min(64) as i32;
                let raw = (*base_ms as f64) * factor.max(1.0).powi(exponent);
                let capped = raw.min(*max_ms as f64);
                let jitter = jitter.clamp(0.0, 1.0);
                let spread = if jitter > 0.0 && capped > 0.0 {
                    let span = capped * jitter;
                    rand::thread_rng().gen_range(-span..=span)
                } else {
                    0.0
                };
                let delay = (capped + spread).clamp(0.0, *max_ms as f64);
                Duration::from_millis(delay as u64)
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            base_ms: 15_000,
            factor: 2.0,
            max_ms: 3_600_000,
            jitter: 0.1,
        }
    }
}

/// What happens to a job once it runs out of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustedAction {
    /// Leave it in `failed` for manual requeue.
    #[default]
    Keep,
    /// Move it to `deleted`.
    Delete,
}

/// Retry policy attached to a job, a registration or the engine config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
    #[serde(default)]
    pub on_exhausted: ExhaustedAction,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff: Backoff::default(),
            on_exhausted: ExhaustedAction::Keep,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_on_exhausted(mut self, action: ExhaustedAction) -> Self {
        self.on_exhausted = action;
        self
    }

    /// Whether another attempt follows the given failed attempt.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay_for_attempt(attempt)
    }
}
