//! Bounded retry-with-backoff readiness polling
//!
//! [`poll`] never fails: exhaustion is an ordinary outcome the caller
//! interprets. [`try_poll`] additionally lets the predicate abort with a
//! hard error.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    #[default]
    Constant,
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct RawRetryPolicy {
    max_attempts: u32,
    interval_ms: u64,
    #[serde(default)]
    backoff: Backoff,
}

/// Retry policy: `max_attempts >= 1`, `interval > 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRetryPolicy", into = "RawRetryPolicy")]
pub struct RetryPolicy {
    max_attempts: u32,
    interval: Duration,
    backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, interval: Duration, backoff: Backoff) -> Result<Self> {
        if max_attempts == 0 {
            return Err(Error::InvalidRetryPolicy {
                reason: "max_attempts must be at least 1".to_string(),
            });
        }
        if interval.is_zero() {
            return Err(Error::InvalidRetryPolicy {
                reason: "interval must be greater than zero".to_string(),
            });
        }
        Ok(Self {
            max_attempts,
            interval,
            backoff,
        })
    }

    /// Constant-interval policy for the documented defaults. Zero inputs are
    /// clamped to the smallest valid value.
    pub fn constant(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval: if interval.is_zero() {
                Duration::from_millis(1)
            } else {
                interval
            },
            backoff: Backoff::Constant,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Delay after the given failed attempt (1-indexed).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self.backoff {
            Backoff::Constant => self.interval,
            Backoff::Linear => self.interval.saturating_mul(attempt),
            Backoff::Exponential => {
                let factor = 2u32.saturating_pow(attempt - 1);
                self.interval.saturating_mul(factor)
            }
        }
    }
}

impl TryFrom<RawRetryPolicy> for RetryPolicy {
    type Error = Error;

    fn try_from(raw: RawRetryPolicy) -> Result<Self> {
        RetryPolicy::new(
            raw.max_attempts,
            Duration::from_millis(raw.interval_ms),
            raw.backoff,
        )
    }
}

impl From<RetryPolicy> for RawRetryPolicy {
    fn from(policy: RetryPolicy) -> Self {
        RawRetryPolicy {
            max_attempts: policy.max_attempts,
            interval_ms: u64::try_from(policy.interval.as_millis()).unwrap_or(u64::MAX),
            backoff: policy.backoff,
        }
    }
}

/// Result of a poll: whether the predicate succeeded and how many calls it took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOutcome {
    pub success: bool,
    pub attempts: u32,
}

/// Call `predicate` up to `policy.max_attempts()` times, sleeping between
/// calls, stopping at the first `true`. The predicate receives the
/// 1-indexed attempt number.
pub async fn poll<F, Fut>(policy: &RetryPolicy, mut predicate: F) -> PollOutcome
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = bool>,
{
    for attempt in 1..=policy.max_attempts {
        if predicate(attempt).await {
            return PollOutcome {
                success: true,
                attempts: attempt,
            };
        }
        if attempt < policy.max_attempts {
            sleep(policy.delay_after(attempt)).await;
        }
    }
    PollOutcome {
        success: false,
        attempts: policy.max_attempts,
    }
}

/// Like [`poll`], but an `Err` from the predicate stops polling and is
/// returned as-is.
pub async fn try_poll<F, Fut>(policy: &RetryPolicy, mut predicate: F) -> Result<PollOutcome>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    for attempt in 1..=policy.max_attempts {
        if predicate(attempt).await? {
            return Ok(PollOutcome {
                success: true,
                attempts: attempt,
            });
        }
        if attempt < policy.max_attempts {
            sleep(policy.delay_after(attempt)).await;
        }
    }
    Ok(PollOutcome {
        success: false,
        attempts: policy.max_attempts,
    })
}
