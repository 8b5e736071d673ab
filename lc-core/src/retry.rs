//! Retry policies for locally originated calls
//!
//! The router never retries forwarded traffic. A node's own calls consult a
//! policy after each retryable failure.

use std::time::Duration;

use crate::error::CallFailure;

pub trait RetryPolicy: Send + Sync {
    /// Delay before attempt `attempt + 1`, or None to give up.
    /// `attempt` counts from 1.
    fn retry_after(&self, attempt: u32, failure: &CallFailure) -> Option<Duration>;
}

/// Fail on the first error
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn retry_after(&self, _attempt: u32, _failure: &CallFailure) -> Option<Duration> {
        None
    }
}

/// Doubling delay, capped
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max: Duration,
    /// Total attempts including the first
    pub max_attempts: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            max_attempts: 3,
        }
    }
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            max,
            max_attempts,
        }
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn retry_after(&self, attempt: u32, failure: &CallFailure) -> Option<Duration> {
        if !failure.is_retryable() || attempt >= self.max_attempts {
            return None;
        }
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        Some(self.initial.saturating_mul(factor).min(self.max))
    }
}
