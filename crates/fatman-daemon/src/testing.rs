//! In-memory server and executor doubles for the work loop tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use fatman_core::{Outcome, Task, TaskData, TaskId, TaskStatus, WorkerId};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::executor::{ExecutionResult, ExecutorError, TaskExecutor};
use crate::transport::{Heartbeat, Submission, TaskTransport};
use crate::workspace::Workspace;

/// A terminal report received by [`FakeTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reported {
    Done(TaskId),
    Failed(TaskId),
}

#[derive(Default)]
struct ServerState {
    pending: VecDeque<Task>,
    owned: Vec<Task>,
    claim_failures: VecDeque<TransportError>,
    report_failures: VecDeque<TransportError>,
    heartbeat_failures: VecDeque<TransportError>,
    expired: HashSet<TaskId>,
    running: Vec<TaskId>,
    reports: Vec<Reported>,
    data: HashMap<TaskId, TaskData>,
    claim_calls: usize,
    heartbeats: usize,
    report_attempts: usize,
}

/// Server double that hands out queued tasks and records reports.
pub struct FakeTransport {
    worker_id: WorkerId,
    state: Mutex<ServerState>,
}

impl FakeTransport {
    pub fn new(pending: Vec<Task>) -> Self {
        Self {
            worker_id: WorkerId::new("test-worker"),
            state: Mutex::new(ServerState {
                pending: pending.into(),
                ..ServerState::default()
            }),
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Tasks returned by `owned_tasks`, i.e. left over from a previous run.
    pub fn with_owned(self, owned: Vec<Task>) -> Self {
        self.state.lock().unwrap().owned = owned;
        self
    }

    /// Make the next `n` claims fail with `err`.
    pub fn fail_claims(&self, n: usize, err: TransportError) {
        let mut state = self.state.lock().unwrap();
        state.claim_failures.extend(std::iter::repeat(err).take(n));
    }

    /// Make the next `n` reports fail with `err`.
    pub fn fail_reports(&self, n: usize, err: TransportError) {
        let mut state = self.state.lock().unwrap();
        state.report_failures.extend(std::iter::repeat(err).take(n));
    }

    /// Make the next `n` heartbeats fail with `err`.
    pub fn fail_heartbeats(&self, n: usize, err: TransportError) {
        let mut state = self.state.lock().unwrap();
        state.heartbeat_failures.extend(std::iter::repeat(err).take(n));
    }

    /// Answer heartbeats for `id` with an expired lease.
    pub fn expire_lease(&self, id: &TaskId) {
        self.state.lock().unwrap().expired.insert(id.clone());
    }

    pub fn reports(&self) -> Vec<Reported> {
        self.state.lock().unwrap().reports.clone()
    }

    pub fn report_data(&self, id: &TaskId) -> Option<TaskData> {
        self.state.lock().unwrap().data.get(id).cloned()
    }

    pub fn marked_running(&self) -> Vec<TaskId> {
        self.state.lock().unwrap().running.clone()
    }

    pub fn claim_calls(&self) -> usize {
        self.state.lock().unwrap().claim_calls
    }

    pub fn heartbeats(&self) -> usize {
        self.state.lock().unwrap().heartbeats
    }

    /// Calls to `submit_result` and `report_failure`, failed ones included.
    pub fn report_attempts(&self) -> usize {
        self.state.lock().unwrap().report_attempts
    }

    fn record(&self, report: Reported, submission: Submission<'_>) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.report_attempts += 1;
        if let Some(err) = state.report_failures.pop_front() {
            return Err(err);
        }
        if state.reports.contains(&report) {
            return Ok(());
        }
        let id = match &report {
            Reported::Done(id) | Reported::Failed(id) => id.clone(),
        };
        state.data.insert(id, submission.data.clone());
        state.reports.push(report);
        Ok(())
    }
}

#[async_trait]
impl TaskTransport for FakeTransport {
    async fn claim_next(&self) -> Result<Option<Task>, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.claim_calls += 1;
        if let Some(err) = state.claim_failures.pop_front() {
            return Err(err);
        }
        Ok(state.pending.pop_front().map(|mut task| {
            task.status = TaskStatus::Claimed;
            task.machine = Some(self.worker_id.clone());
            task
        }))
    }

    async fn heartbeat(&self, task: &Task) -> Result<Heartbeat, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.heartbeats += 1;
        if let Some(err) = state.heartbeat_failures.pop_front() {
            return Err(err);
        }
        if state.expired.contains(&task.id) {
            Ok(Heartbeat::LeaseExpired)
        } else {
            Ok(Heartbeat::Alive)
        }
    }

    async fn mark_running(&self, task: &Task) -> Result<(), TransportError> {
        self.state.lock().unwrap().running.push(task.id.clone());
        Ok(())
    }

    async fn fetch_inputs(&self, _task: &Task, _dir: &Path) -> Result<(), TransportError> {
        Ok(())
    }

    async fn submit_result(&self, task: &Task, submission: Submission<'_>) -> Result<(), TransportError> {
        self.record(Reported::Done(task.id.clone()), submission)
    }

    async fn report_failure(&self, task: &Task, submission: Submission<'_>) -> Result<(), TransportError> {
        self.record(Reported::Failed(task.id.clone()), submission)
    }

    async fn owned_tasks(&self) -> Result<Vec<Task>, TransportError> {
        Ok(std::mem::take(&mut self.state.lock().unwrap().owned))
    }
}

/// What [`FakeExecutor`] does with every task.
#[derive(Debug, Clone, Copy)]
pub enum Script {
    /// Succeed after the given time.
    Succeed(Duration),
    /// Fail immediately.
    Fail,
    /// Never finish on its own; times out after the executor's limit.
    Hang,
}

/// Executor double that follows a [`Script`] and tracks concurrency.
pub struct FakeExecutor {
    root: TempDir,
    script: Script,
    timeout: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    started: AtomicUsize,
    finished: AtomicUsize,
}

impl FakeExecutor {
    pub fn new(script: Script) -> Self {
        Self {
            root: tempfile::tempdir().unwrap(),
            script,
            timeout: Duration::from_secs(3600),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            started: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Number of working scopes still on disk.
    pub fn leftover_scopes(&self) -> usize {
        std::fs::read_dir(self.root.path()).unwrap().count()
    }
}

#[async_trait]
impl TaskExecutor for FakeExecutor {
    fn prepare(&self, task: &Task) -> Result<Workspace, ExecutorError> {
        Ok(Workspace::create(self.root.path(), &task.id)?)
    }

    async fn run(&self, task: &Task, workspace: Workspace, cancel: CancellationToken) -> ExecutionResult {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let outcome = match self.script {
            Script::Succeed(after) => tokio::select! {
                _ = cancel.cancelled() => Outcome::Cancelled,
                _ = tokio::time::sleep(after) => Outcome::Succeeded,
            },
            Script::Fail => Outcome::Failed("exit status 1".to_string()),
            Script::Hang => tokio::select! {
                _ = cancel.cancelled() => Outcome::Cancelled,
                _ = tokio::time::sleep(self.timeout) => Outcome::TimedOut,
            },
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.finished.fetch_add(1, Ordering::SeqCst);
        ExecutionResult::with_outcome(task, outcome, workspace)
    }
}

/// Poll `condition` until it holds, failing the test after a few seconds.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
