//! Retrying server calls with exponential backoff.

use std::future::Future;

use fatman_core::{RetryDecision, RetryPolicy};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::TransportError;

/// Result of a retried call.
#[derive(Debug)]
pub enum Attempt<T> {
    /// The call succeeded.
    Done(T),
    /// The call failed with an error that is not worth retrying, or the
    /// retry budget ran out.
    GaveUp(TransportError),
    /// `cancel` fired before a call succeeded.
    Cancelled,
}

/// Run `call` until it succeeds, the policy gives up, or `cancel` fires.
///
/// Only transient errors are retried; the delay grows per [`RetryPolicy`].
/// Both the call in flight and the wait between calls give way to `cancel`.
pub async fn with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation: &str,
    mut call: F,
) -> Attempt<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let mut failures = 0u32;
    loop {
        let err = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Attempt::Cancelled,
            result = call() => match result {
                Ok(value) => return Attempt::Done(value),
                Err(e) => e,
            },
        };

        failures += 1;
        match policy.decide(failures, err.kind()) {
            RetryDecision::GiveUp => return Attempt::GaveUp(err),
            RetryDecision::Retry(delay) => {
                warn!(
                    operation,
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Server call failed, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Attempt::Cancelled,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
