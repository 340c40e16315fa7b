//! Retry eligibility for failed deliveries.
//!
//! With the default policy (`max_attempts = 1`) every failure is terminal
//! and the message ends FAILED. Raising `max_attempts` lets transient
//! failures go back to PENDING with a later `dt_queue`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

/// Retry policy applied to failed delivery attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of delivery attempts, including the first.
    pub max_attempts: u32,

    /// Base delay for the backoff calculation.
    pub base_delay: Duration,

    /// Maximum delay between attempts.
    pub max_delay: Duration,

    /// Jitter fraction (0.0 to 1.0) applied to the delay.
    pub jitter_factor: f64,

    /// Strategy for calculating backoff delays.
    pub backoff_strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(3600),
            jitter_factor: 0.25,
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Whether any failure can be retried at all.
    pub fn allows_retries(&self) -> bool {
        self.max_attempts > 1
    }
}

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Same delay before every retry.
    Fixed,
    /// Delay doubles with every attempt.
    Exponential,
    /// Delay grows by the base delay with every attempt.
    Linear,
}

/// A failed attempt to decide on.
#[derive(Debug, Clone)]
pub struct RetryContext<'a> {
    /// Number of the attempt that failed (1-based).
    pub attempt_number: u32,
    /// Error that caused the failure.
    pub error: &'a DeliveryError,
    /// Time of the failed attempt.
    pub failed_at: DateTime<Utc>,
    /// Policy to apply.
    pub policy: &'a RetryPolicy,
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Queue the message again at the given time.
    Retry {
        /// New `dt_queue` of the message
        next_attempt_at: DateTime<Utc>,
    },
    /// Record the failure as terminal.
    GiveUp {
        /// Why no retry happens
        reason: String,
    },
}

impl<'a> RetryContext<'a> {
    /// Creates a new retry context.
    pub fn new(
        attempt_number: u32,
        error: &'a DeliveryError,
        failed_at: DateTime<Utc>,
        policy: &'a RetryPolicy,
    ) -> Self {
        Self { attempt_number, error, failed_at, policy }
    }

    /// Decides whether and when to retry.
    ///
    /// Respects a 429 `Retry-After` and never retries non-retryable errors.
    pub fn decide_retry(&self) -> RetryDecision {
        if self.attempt_number >= self.policy.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({}) reached", self.policy.max_attempts),
            };
        }

        if !self.error.is_retryable() {
            return RetryDecision::GiveUp {
                reason: format!("non-retryable error: {}", self.error),
            };
        }

        let delay = self.calculate_delay();
        let next_attempt_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| self.failed_at.checked_add_signed(delay));
        let Some(next_attempt_at) = next_attempt_at else {
            return RetryDecision::GiveUp {
                reason: "retry delay duration out of range".to_string(),
            };
        };

        RetryDecision::Retry { next_attempt_at }
    }

    fn calculate_delay(&self) -> Duration {
        if let Some(retry_after_seconds) = self.error.retry_after_seconds() {
            return Duration::from_secs(retry_after_seconds);
        }

        let base_delay = match self.policy.backoff_strategy {
            BackoffStrategy::Fixed => self.policy.base_delay,
            BackoffStrategy::Linear => self.policy.base_delay * self.attempt_number.max(1),
            BackoffStrategy::Exponential => {
                let exponent = self.attempt_number.saturating_sub(1).min(20);
                self.policy.base_delay * 2_u32.saturating_pow(exponent)
            },
        };

        let capped_delay = std::cmp::min(base_delay, self.policy.max_delay);
        let jittered_delay = apply_jitter(capped_delay, self.policy.jitter_factor);

        std::cmp::min(jittered_delay, self.policy.max_delay)
    }
}

/// Randomizes a delay by up to `±jitter_factor` of its length.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 || duration.is_zero() {
        return duration;
    }

    let jitter_range = duration.as_secs_f64() * jitter_factor.clamp(0.0, 1.0);
    let jitter_offset = rand::rng().random_range(-jitter_range..=jitter_range);

    Duration::from_secs_f64((duration.as_secs_f64() + jitter_offset).max(0.0))
}
