//! The claim / execute / report loop.
//!
//! The loop runs a fixed number of slots. Each slot claims one task at a time,
//! keeps its lease alive with heartbeats while it runs, and reports the result.
//!
//! Shutdown has two stages: the `stop` token ends claiming and lets in-flight
//! tasks finish; once the grace period is over the `halt` token aborts them.
//! Both stages also apply while startup recovery is still running.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use chrono::Utc;
use fatman_core::{ClaimLease, RetryPolicy, SlotState, Task, TaskStatus, WorkerId};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::{with_backoff, Attempt};
use crate::config::Config;
use crate::error::{DaemonError, TransportError};
use crate::executor::{ExecutionResult, TaskExecutor};
use crate::reporter::{Delivery, ResultReporter};
use crate::transport::{Heartbeat, TaskTransport};

/// Settings of the loop, taken from [`Config`].
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub worker_id: WorkerId,
    pub pool_size: usize,
    pub poll_interval: Duration,
    pub lease_duration: Duration,
    pub heartbeat_interval: Duration,
    pub grace_period: Duration,
    pub retry: RetryPolicy,
}

impl From<&Config> for LoopSettings {
    fn from(config: &Config) -> Self {
        Self {
            worker_id: config.worker_id.clone(),
            pool_size: config.pool_size,
            poll_interval: config.poll_interval,
            lease_duration: config.lease_duration,
            heartbeat_interval: config.heartbeat_interval,
            grace_period: config.grace_period,
            retry: config.retry,
        }
    }
}

/// Why a claim stopped being ours while the task was running.
#[derive(Debug, Clone)]
enum LeaseLoss {
    /// The server answered the heartbeat with an expired lease.
    Expired,
    /// No heartbeat got through before the lease ran out.
    Unrenewed,
    /// Credentials were rejected.
    Unauthorized(String),
}

/// One concurrent execution context.
struct Slot {
    index: usize,
    state: SlotState,
}

impl Slot {
    fn advance(&mut self, next: SlotState) -> Result<(), DaemonError> {
        let from = self.state;
        self.state = from
            .transition(next)
            .map_err(|e| DaemonError::Internal(format!("slot {}: {}", self.index, e)))?;
        debug!(slot = self.index, from = ?from, to = ?next, "Slot state changed");
        Ok(())
    }
}

/// The daemon's scheduler.
pub struct WorkLoop {
    transport: Arc<dyn TaskTransport>,
    executor: Arc<dyn TaskExecutor>,
    reporter: ResultReporter,
    settings: LoopSettings,
    /// Claimed tasks recovered at startup, run before new claims.
    backlog: Mutex<VecDeque<Task>>,
}

impl WorkLoop {
    /// Create a new loop.
    pub fn new(
        transport: Arc<dyn TaskTransport>,
        executor: Arc<dyn TaskExecutor>,
        settings: LoopSettings,
    ) -> Self {
        let reporter = ResultReporter::new(transport.clone(), settings.retry);
        Self {
            transport,
            executor,
            reporter,
            settings,
            backlog: Mutex::new(VecDeque::new()),
        }
    }

    /// Run until `shutdown` is cancelled or a fatal error occurs.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), DaemonError> {
        let this = Arc::new(self);
        let halt = CancellationToken::new();
        let stop = halt.child_token();

        info!(
            worker_id = %this.settings.worker_id,
            slots = this.settings.pool_size,
            "Starting work loop"
        );

        let _watcher = AbortOnDropHandle::new(tokio::spawn(watch_shutdown(
            shutdown,
            stop.clone(),
            halt.clone(),
            this.settings.grace_period,
        )));

        let mut outcome = this.recover(&stop, &halt).await;

        let mut slots = JoinSet::new();
        if outcome.is_ok() {
            for index in 0..this.settings.pool_size {
                let worker = this.clone();
                let (stop, halt) = (stop.clone(), halt.clone());
                slots.spawn(async move { worker.run_slot(index, stop, halt).await });
            }
        }

        let mut aborted = false;
        loop {
            tokio::select! {
                joined = slots.join_next() => match joined {
                    None => break,
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(e))) => {
                        error!(error = %e, "Fatal error, stopping all slots");
                        if outcome.is_ok() {
                            outcome = Err(e);
                        }
                        halt.cancel();
                    }
                    Some(Err(e)) if e.is_cancelled() => {}
                    Some(Err(e)) => {
                        error!(error = %e, "Slot panicked, stopping all slots");
                        if outcome.is_ok() {
                            outcome = Err(DaemonError::Internal(e.to_string()));
                        }
                        halt.cancel();
                    }
                },
                _ = halt.cancelled(), if !aborted => {
                    aborted = true;
                    slots.abort_all();
                }
            }
        }

        halt.cancel();
        info!("Work loop stopped");
        outcome
    }

    /// Pick up tasks this worker still holds from a previous run.
    ///
    /// Claimed tasks are queued for execution. Tasks that were already
    /// running cannot be resumed and are reported as failed.
    async fn recover(&self, stop: &CancellationToken, halt: &CancellationToken) -> Result<(), DaemonError> {
        let transport = self.transport.as_ref();
        let owned = match with_backoff(&self.settings.retry, stop, "owned_tasks", move || async move {
            transport.owned_tasks().await
        })
        .await
        {
            Attempt::Done(tasks) => tasks,
            Attempt::Cancelled => return Ok(()),
            Attempt::GaveUp(TransportError::Auth(msg)) => return Err(DaemonError::Auth(msg)),
            Attempt::GaveUp(e) => {
                warn!(error = %e, "Could not look up tasks from a previous run");
                return Ok(());
            }
        };

        for task in owned {
            match task.status {
                TaskStatus::Claimed => {
                    info!(task_id = %task.id, "Recovered claimed task, queueing");
                    self.queue(task);
                }
                TaskStatus::Running => {
                    warn!(task_id = %task.id, "Task was running when the daemon stopped, reporting failure");
                    let result = ExecutionResult::failed(
                        &task,
                        "interrupted",
                        "daemon stopped while the task was running",
                        None,
                    );
                    if let Delivery::PermanentlyFailed(reason) = self.reporter.deliver(&task, &result, halt).await? {
                        warn!(task_id = %task.id, reason = %reason, "Interrupted task left to lease expiry");
                    }
                }
                other => debug!(task_id = %task.id, status = %other, "Ignoring owned task"),
            }
        }
        Ok(())
    }

    fn queue(&self, task: Task) {
        self.backlog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(task);
    }

    fn dequeue(&self) -> Option<Task> {
        self.backlog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    async fn run_slot(
        self: Arc<Self>,
        index: usize,
        stop: CancellationToken,
        halt: CancellationToken,
    ) -> Result<(), DaemonError> {
        let mut slot = Slot {
            index,
            state: SlotState::Idle,
        };

        while !stop.is_cancelled() {
            slot.advance(SlotState::Claiming)?;
            let Some(task) = self.next_task(&stop).await? else {
                slot.advance(SlotState::Idle)?;
                debug!(slot = index, nap_secs = self.settings.poll_interval.as_secs(), "No work, napping");
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(self.settings.poll_interval) => {}
                }
                continue;
            };

            slot.advance(SlotState::Running)?;
            self.process(&mut slot, task, &halt).await?;
            slot.advance(SlotState::Idle)?;
        }

        debug!(slot = index, "Slot stopped");
        Ok(())
    }

    async fn next_task(&self, stop: &CancellationToken) -> Result<Option<Task>, DaemonError> {
        if let Some(task) = self.dequeue() {
            return Ok(Some(task));
        }

        let transport = self.transport.as_ref();
        let claimed = with_backoff(&self.settings.retry, stop, "claim_next", move || async move {
            transport.claim_next().await
        })
        .await;
        match claimed {
            Attempt::Done(task) => Ok(task),
            Attempt::Cancelled => Ok(None),
            Attempt::GaveUp(TransportError::Auth(msg)) => Err(DaemonError::Auth(msg)),
            Attempt::GaveUp(e) => {
                error!(error = %e, "Failed to claim a task");
                Ok(None)
            }
        }
    }

    /// Run one claimed task and report its result.
    async fn process(&self, slot: &mut Slot, task: Task, halt: &CancellationToken) -> Result<(), DaemonError> {
        info!(slot = slot.index, task_id = %task.id, runner = %task.kind(), "Processing task");

        // counted from now: a recovered claim may be far older than one lease
        let lease = ClaimLease::new(
            task.id.clone(),
            self.settings.worker_id.clone(),
            self.settings.lease_duration,
        );
        let cancel = halt.child_token();
        let lost = Arc::new(OnceLock::new());
        let _heartbeat = AbortOnDropHandle::new(tokio::spawn(keep_alive(
            self.transport.clone(),
            task.clone(),
            lease,
            self.settings.heartbeat_interval,
            cancel.clone(),
            lost.clone(),
        )));

        let result = self.execute(&task, &cancel).await?;

        if let Some(loss) = lost.get() {
            if let Some(result) = result {
                result.discard();
            }
            return match loss {
                LeaseLoss::Unauthorized(msg) => Err(DaemonError::Auth(msg.clone())),
                LeaseLoss::Expired | LeaseLoss::Unrenewed => {
                    warn!(task_id = %task.id, reason = ?loss, "Lease lost, dropping task without report");
                    Ok(())
                }
            };
        }

        let Some(result) = result else {
            info!(task_id = %task.id, "Task abandoned");
            return Ok(());
        };
        if !result.outcome.is_reportable() {
            info!(task_id = %task.id, outcome = %result.outcome, "Task abandoned");
            result.discard();
            return Ok(());
        }

        slot.advance(SlotState::Reporting)?;
        let delivery = self.reporter.deliver(&task, &result, &cancel).await;
        result.discard();
        match delivery? {
            Delivery::PermanentlyFailed(reason) => {
                warn!(task_id = %task.id, reason = %reason, "Result lost, task left to lease expiry");
            }
            Delivery::Abandoned => {
                if let Some(LeaseLoss::Unauthorized(msg)) = lost.get() {
                    return Err(DaemonError::Auth(msg.clone()));
                }
                if let Some(loss) = lost.get() {
                    warn!(task_id = %task.id, reason = ?loss, "Lease lost while reporting, result dropped");
                }
            }
            Delivery::Delivered => {}
        }
        Ok(())
    }

    /// Prepare and run the task. `None` means the task was given up without a
    /// result to report.
    async fn execute(&self, task: &Task, cancel: &CancellationToken) -> Result<Option<ExecutionResult>, DaemonError> {
        let workspace = match self.executor.prepare(task) {
            Ok(workspace) => workspace,
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Failed to prepare task");
                return Ok(Some(ExecutionResult::failed(task, "workspace", e.to_string(), None)));
            }
        };

        let transport = self.transport.as_ref();
        let dir = workspace.path();
        let fetched = with_backoff(&self.settings.retry, cancel, "fetch_inputs", move || async move {
            transport.fetch_inputs(task, dir).await
        })
        .await;
        match fetched {
            Attempt::Done(()) => {}
            Attempt::Cancelled => return Ok(None),
            Attempt::GaveUp(TransportError::Auth(msg)) => return Err(DaemonError::Auth(msg)),
            Attempt::GaveUp(e) => {
                warn!(task_id = %task.id, error = %e, "Failed to fetch input files");
                return Ok(Some(ExecutionResult::failed(task, "infiles", e.to_string(), Some(workspace))));
            }
        }

        let marked = with_backoff(&self.settings.retry, cancel, "mark_running", move || async move {
            transport.mark_running(task).await
        })
        .await;
        match marked {
            Attempt::Done(()) => {}
            Attempt::Cancelled => return Ok(None),
            Attempt::GaveUp(TransportError::Auth(msg)) => return Err(DaemonError::Auth(msg)),
            Attempt::GaveUp(TransportError::Conflict(msg)) => {
                warn!(task_id = %task.id, reason = %msg, "Task no longer ours, not running it");
                return Ok(None);
            }
            Attempt::GaveUp(e) => {
                warn!(task_id = %task.id, error = %e, "Could not mark task running, running anyway");
            }
        }

        Ok(Some(self.executor.run(task, workspace, cancel.clone()).await))
    }
}

/// Turn the external `shutdown` signal into the two shutdown stages.
async fn watch_shutdown(
    shutdown: CancellationToken,
    stop: CancellationToken,
    halt: CancellationToken,
    grace: Duration,
) {
    tokio::select! {
        _ = halt.cancelled() => return,
        _ = shutdown.cancelled() => {}
    }
    info!(grace_secs = grace.as_secs(), "Shutdown requested, finishing in-flight tasks");
    stop.cancel();

    tokio::select! {
        _ = halt.cancelled() => {}
        _ = tokio::time::sleep(grace) => {
            warn!("Grace period expired, aborting in-flight tasks");
            halt.cancel();
        }
    }
}

/// Renew the lease on `task` until `cancel` fires.
///
/// Losing the lease cancels `cancel`, which stops the execution.
async fn keep_alive(
    transport: Arc<dyn TaskTransport>,
    task: Task,
    mut lease: ClaimLease,
    every: Duration,
    cancel: CancellationToken,
    lost: Arc<OnceLock<LeaseLoss>>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let lose = |loss: LeaseLoss| {
        let _ = lost.set(loss);
        cancel.cancel();
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let answer = tokio::select! {
            _ = cancel.cancelled() => return,
            answer = transport.heartbeat(&task) => answer,
        };
        match answer {
            Ok(Heartbeat::Alive) => {
                lease.renew(Utc::now());
                debug!(task_id = %task.id, expires_at = %lease.expires_at(), "Lease renewed");
            }
            Ok(Heartbeat::LeaseExpired) => {
                warn!(task_id = %task.id, "Server reports the lease expired, cancelling task");
                lose(LeaseLoss::Expired);
                return;
            }
            Err(TransportError::Auth(msg)) => {
                lose(LeaseLoss::Unauthorized(msg));
                return;
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Heartbeat failed");
                if lease.is_expired(Utc::now()) {
                    warn!(task_id = %task.id, "Lease ran out without renewal, cancelling task");
                    lose(LeaseLoss::Unrenewed);
                    return;
                }
            }
        }
    }
}
