//! Retry-with-backoff policy.
//!
//! The decision is a pure function of the attempt count and the kind of
//! error, so it can be tested without any network.

use std::time::Duration;

/// Classification of a failed call for retry purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Network or server unavailable; worth retrying.
    Transient,
    /// Credentials rejected; nothing can proceed.
    Auth,
    /// The request itself is bad (payload too large, unknown task, ...).
    Permanent,
    /// The server state moved on (claim race lost, lease reassigned).
    Conflict,
}

impl ErrorKind {
    /// Whether an error of this kind may succeed when repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after the given delay.
    Retry(Duration),
    /// Stop retrying.
    GiveUp,
}

/// Exponential backoff bounded by a maximum number of retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Create a new policy.
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// Decide whether to retry after `failures` failed attempts (1-based).
    pub fn decide(&self, failures: u32, kind: ErrorKind) -> RetryDecision {
        if !kind.is_retryable() || failures == 0 || failures > self.max_retries {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(self.delay_for(failures))
    }

    /// Backoff delay before retry number `failures` (1-based).
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}
