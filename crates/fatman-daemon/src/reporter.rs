//! Delivery of execution results to the server.

use std::sync::Arc;

use fatman_core::{Outcome, RetryPolicy, Task};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backoff::{with_backoff, Attempt};
use crate::error::{DaemonError, TransportError};
use crate::executor::ExecutionResult;
use crate::transport::{Submission, TaskTransport};

/// How a report ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The server accepted the result.
    Delivered,
    /// The report could not be delivered; the lease will expire and the
    /// server may reassign the task.
    PermanentlyFailed(String),
    /// Nothing was reported (cancelled run, lost lease or shutdown during delivery).
    Abandoned,
}

/// Reports results, retrying transient failures.
pub struct ResultReporter {
    transport: Arc<dyn TaskTransport>,
    policy: RetryPolicy,
}

impl ResultReporter {
    /// Create a new reporter.
    pub fn new(transport: Arc<dyn TaskTransport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    /// Deliver `result` for `task`.
    ///
    /// Success goes through `submit_result`, every other reportable outcome
    /// through `report_failure`. Rejected credentials are returned as an
    /// error because no further task can be reported either.
    pub async fn deliver(
        &self,
        task: &Task,
        result: &ExecutionResult,
        cancel: &CancellationToken,
    ) -> Result<Delivery, DaemonError> {
        if !result.outcome.is_reportable() {
            info!(task_id = %task.id, outcome = %result.outcome, "Not reporting result");
            return Ok(Delivery::Abandoned);
        }

        let submission = Submission {
            artifacts: &result.artifacts,
            data: &result.data,
        };
        let success = matches!(result.outcome, Outcome::Succeeded);
        let operation = if success { "submit_result" } else { "report_failure" };

        let transport = self.transport.as_ref();
        let attempt = with_backoff(&self.policy, cancel, operation, move || async move {
            if success {
                transport.submit_result(task, submission).await
            } else {
                transport.report_failure(task, submission).await
            }
        })
        .await;

        match attempt {
            Attempt::Done(()) => {
                info!(
                    task_id = %task.id,
                    outcome = %result.outcome,
                    artifacts = result.artifacts.len(),
                    "Result delivered"
                );
                Ok(Delivery::Delivered)
            }
            Attempt::Cancelled => {
                warn!(task_id = %task.id, "Delivery cancelled, result dropped");
                Ok(Delivery::Abandoned)
            }
            Attempt::GaveUp(TransportError::Auth(msg)) => Err(DaemonError::Auth(msg)),
            Attempt::GaveUp(e) => {
                error!(task_id = %task.id, error = %e, "Failed to deliver result");
                Ok(Delivery::PermanentlyFailed(e.to_string()))
            }
        }
    }
}
