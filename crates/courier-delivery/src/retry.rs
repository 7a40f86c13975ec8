//! Exponential backoff with jitter and retry eligibility.
//!
//! Pure computation: the strategy holds an immutable [`RetryPolicy`] and
//! answers two questions for a failed attempt, whether to retry and how long
//! to wait. The queue manager applies the answer to the job.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

/// Backoff configuration, fixed for the lifetime of a queue manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,

    /// Delay before the first retry is multiplied from this value.
    pub base_delay: Duration,

    /// Upper bound for any computed delay.
    pub max_delay: Duration,

    /// Growth factor per retry.
    pub backoff_multiplier: f64,

    /// Total jitter width as a percentage of the capped delay (0 to 100).
    /// A value of 20 perturbs a 10s delay uniformly within 9s..=11s.
    pub jitter_percent: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: crate::DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            jitter_percent: 20.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that retries immediately, for tests and local destinations.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter_percent: 0.0,
        }
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt.
    Retry {
        /// Retry count to record on the job.
        retry_count: u32,
        /// Earliest time for the next attempt.
        next_attempt_at: DateTime<Utc>,
    },
    /// Stop; the job fails terminally.
    GiveUp {
        /// Why no further attempt will be made.
        reason: String,
    },
}

/// Computes backoff delays and retry eligibility from a [`RetryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct RetryStrategy {
    policy: RetryPolicy,
}

impl RetryStrategy {
    /// Creates a strategy for `policy`.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// The policy this strategy applies.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Delay before jitter: `min(base * multiplier^attempt, max_delay)`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs =
            self.policy.base_delay.as_secs_f64() * self.policy.backoff_multiplier.powi(exponent);
        let max_secs = self.policy.max_delay.as_secs_f64();

        if !secs.is_finite() || secs >= max_secs {
            return self.policy.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Jittered delay for `attempt`, always within `[0, max_delay]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let capped = self.base_delay(attempt);
        apply_jitter(capped, self.policy.jitter_percent).min(self.policy.max_delay)
    }

    /// Returns true if a failure at `attempt` retries already consumed may be
    /// retried.
    pub fn should_retry(&self, attempt: u32, error: &DeliveryError) -> bool {
        attempt < self.policy.max_retries && error.is_retryable()
    }

    /// Decides what to do after a failed attempt.
    ///
    /// `retry_count` is the number of retries already consumed. A retry
    /// records `retry_count + 1` and waits `delay(retry_count + 1)`, or the
    /// server's Retry-After hint when that is longer, never beyond
    /// `max_delay`.
    pub fn decide(
        &self,
        retry_count: u32,
        error: &DeliveryError,
        failed_at: DateTime<Utc>,
    ) -> RetryDecision {
        self.decide_within(retry_count, self.policy.max_retries, error, failed_at)
    }

    /// Like [`decide`](Self::decide), with a per-job retry budget.
    pub fn decide_within(
        &self,
        retry_count: u32,
        max_retries: u32,
        error: &DeliveryError,
        failed_at: DateTime<Utc>,
    ) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::GiveUp { reason: format!("non-retryable error: {error}") };
        }

        if retry_count >= max_retries {
            return RetryDecision::GiveUp {
                reason: format!("retry budget of {max_retries} exhausted: {error}"),
            };
        }

        let next = retry_count + 1;
        let mut delay = self.delay(next);
        if let Some(retry_after) = error.retry_after_seconds() {
            delay = delay.max(Duration::from_secs(retry_after)).min(self.policy.max_delay);
        }

        let Ok(chrono_delay) = chrono::Duration::from_std(delay) else {
            return RetryDecision::GiveUp {
                reason: "retry delay duration out of range".to_string(),
            };
        };

        RetryDecision::Retry { retry_count: next, next_attempt_at: failed_at + chrono_delay }
    }
}

/// Perturbs `duration` uniformly by `± duration * jitter_percent / 200`.
fn apply_jitter(duration: Duration, jitter_percent: f64) -> Duration {
    if jitter_percent <= 0.0 || duration.is_zero() {
        return duration;
    }

    let fraction = jitter_percent.clamp(0.0, 100.0) / 100.0;
    let half_range = duration.as_secs_f64() * fraction / 2.0;

    let mut rng = rand::rng();
    let offset = rng.random_range(-half_range..=half_range);

    Duration::from_secs_f64((duration.as_secs_f64() + offset).max(0.0))
}
