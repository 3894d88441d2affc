//! Task execution.
//!
//! A task runs inside its own [`Workspace`]. The `direct` runner executes the
//! task's commands one after another, capturing each command's stdout and
//! stderr to `<name>.out` / `<name>.err` in the workspace.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use fatman_core::{is_relative_inside, CommandStatus, Diagnostic, Outcome, Task, TaskData, TaskId};
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::workspace::{collect_artifacts, Artifact, Workspace};

/// Errors that can occur before a task starts executing.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to create working scope: {0}")]
    Workspace(#[from] std::io::Error),
}

/// Everything a run produced. Owns the workspace, which is removed when the
/// result is dropped.
#[derive(Debug)]
pub struct ExecutionResult {
    /// Task the result belongs to.
    pub task_id: TaskId,
    /// How execution ended.
    pub outcome: Outcome,
    /// Exit status of every command that was started.
    pub commands: Vec<CommandStatus>,
    /// Result document with warnings and errors.
    pub data: TaskData,
    /// Files to upload.
    pub artifacts: Vec<Artifact>,
    /// Wall-clock time spent executing.
    pub duration: Duration,
    workspace: Option<Workspace>,
}

impl ExecutionResult {
    /// A failure that happened outside of the runner, e.g. while preparing inputs.
    pub fn failed(task: &Task, tag: &str, reason: impl Into<String>, workspace: Option<Workspace>) -> Self {
        let reason = reason.into();
        let mut data = TaskData::from_existing(task.data.as_ref());
        data.error(Diagnostic::new(tag, task.id.as_str(), reason.as_str()));
        Self {
            task_id: task.id.clone(),
            outcome: Outcome::Failed(reason),
            commands: Vec::new(),
            data,
            artifacts: Vec::new(),
            duration: Duration::ZERO,
            workspace,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_outcome(task: &Task, outcome: Outcome, workspace: Workspace) -> Self {
        Self {
            task_id: task.id.clone(),
            outcome,
            commands: Vec::new(),
            data: TaskData::default(),
            artifacts: Vec::new(),
            duration: Duration::ZERO,
            workspace: Some(workspace),
        }
    }

    /// Location of the workspace, if the result still holds one.
    pub fn workspace_path(&self) -> Option<&Path> {
        self.workspace.as_ref().map(Workspace::path)
    }

    /// Discard the result and remove its workspace.
    pub fn discard(mut self) {
        if let Some(workspace) = self.workspace.take() {
            let path = workspace.path().to_path_buf();
            if let Err(e) = workspace.close() {
                warn!(task_id = %self.task_id, dir = %path.display(), error = %e, "Failed to remove working scope");
            }
        }
    }
}

/// Runs claimed tasks.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Create the working scope for a task.
    fn prepare(&self, task: &Task) -> Result<Workspace, ExecutorError>;

    /// Run the task to completion inside `workspace`.
    ///
    /// Never fails: timeouts, failing commands and cancellation are all
    /// reported through [`ExecutionResult::outcome`].
    async fn run(&self, task: &Task, workspace: Workspace, cancel: CancellationToken) -> ExecutionResult;
}

/// Runner for tasks whose commands execute directly on this machine.
pub const DIRECT_RUNNER: &str = "direct";

/// Executes tasks as local processes.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    data_dir: PathBuf,
    timeout: Duration,
}

/// State accumulated while the commands run.
#[derive(Default)]
struct RunState {
    data: TaskData,
    commands: Vec<CommandStatus>,
    captured: Vec<PathBuf>,
}

enum Phase {
    Finished(Result<(), String>),
    TimedOut,
    Cancelled,
}

impl ProcessExecutor {
    /// Create a new executor placing working scopes below `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            data_dir: data_dir.into(),
            timeout,
        }
    }

    async fn run_direct(&self, task: &Task, dir: &Path, state: &mut RunState) -> Result<(), String> {
        let variables = task.settings.environment.string_variables();

        for entry in &task.settings.commands {
            let name = entry.name.as_str();
            if !is_relative_inside(name) || name.contains('/') {
                state
                    .data
                    .error(Diagnostic::new("commands", name, "invalid command name"));
                return Err(format!("invalid command name '{}'", name));
            }

            let stdout_path = dir.join(format!("{}.out", name));
            let stderr_path = dir.join(format!("{}.err", name));
            let (stdout, stderr) = match (
                std::fs::File::create(&stdout_path),
                std::fs::File::create(&stderr_path),
            ) {
                (Ok(out), Ok(err)) => (out, err),
                (Err(e), _) | (_, Err(e)) => {
                    let msg = format!("error when opening output files: {}", e);
                    state.data.error(Diagnostic::new("commands", name, msg.as_str()));
                    return Err(msg);
                }
            };
            state.captured.push(stdout_path);
            state.captured.push(stderr_path);

            info!(task_id = %task.id, command = %name, "Running command");

            let mut cmd = Command::new(&entry.cmd);
            cmd.args(entry.string_args())
                .envs(variables.iter().map(|(k, v)| (k, v)))
                .current_dir(dir)
                .stdin(Stdio::null())
                .stdout(Stdio::from(stdout))
                .stderr(Stdio::from(stderr))
                .kill_on_drop(true);

            let status = match cmd.spawn() {
                Ok(mut child) => child.wait().await,
                Err(e) => Err(e),
            };

            let status = match status {
                Ok(status) => status,
                Err(e) => {
                    state.commands.push(CommandStatus {
                        name: name.to_string(),
                        exit_code: None,
                    });
                    let msg = format!("error occurred while running: {}", e);
                    state.data.error(Diagnostic::new("commands", name, msg.as_str()));
                    return Err(msg);
                }
            };

            let exit_code = status.code();
            state.commands.push(CommandStatus {
                name: name.to_string(),
                exit_code,
            });
            debug!(task_id = %task.id, command = %name, exit_code = ?exit_code, "Command finished");

            if !status.success() {
                let diagnostic = Diagnostic::new(
                    "commands",
                    name,
                    "command terminated with non-zero exit status",
                )
                .with_returncode(exit_code.unwrap_or(-1));

                if entry.ignore_returncode {
                    state.data.warn(diagnostic);
                } else {
                    state.data.error(diagnostic);
                    return Err(format!(
                        "command '{}' terminated with exit status {}",
                        name,
                        exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string())
                    ));
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl TaskExecutor for ProcessExecutor {
    fn prepare(&self, task: &Task) -> Result<Workspace, ExecutorError> {
        Ok(Workspace::create(&self.data_dir, &task.id)?)
    }

    async fn run(&self, task: &Task, workspace: Workspace, cancel: CancellationToken) -> ExecutionResult {
        let started = Instant::now();
        let mut state = RunState {
            data: TaskData::from_existing(task.data.as_ref()),
            ..RunState::default()
        };

        let phase = match task.kind() {
            DIRECT_RUNNER => {
                if !task.settings.environment.modules.is_empty() {
                    state.data.warn(Diagnostic::new(
                        "environment",
                        "modules",
                        "environment modules are not supported by this runner, not loaded",
                    ));
                }

                let run = self.run_direct(task, workspace.path(), &mut state);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Phase::Cancelled,
                    res = tokio::time::timeout(self.timeout, run) => match res {
                        Ok(done) => Phase::Finished(done),
                        Err(_) => Phase::TimedOut,
                    },
                }
            }
            other => {
                state
                    .data
                    .error(Diagnostic::new("runner", other, "runner is not (yet) implemented"));
                Phase::Finished(Err(format!("runner '{}' is not (yet) implemented", other)))
            }
        };

        let outcome = match phase {
            Phase::Finished(Ok(())) => Outcome::Succeeded,
            Phase::Finished(Err(reason)) => Outcome::Failed(reason),
            Phase::TimedOut => {
                warn!(task_id = %task.id, timeout_secs = self.timeout.as_secs(), "Task exceeded its wall-clock limit");
                state.data.error(Diagnostic::new(
                    "timeout",
                    task.id.as_str(),
                    format!("task exceeded its wall-clock limit of {}s and was terminated", self.timeout.as_secs()),
                ));
                Outcome::TimedOut
            }
            Phase::Cancelled => Outcome::Cancelled,
        };

        let artifacts = if outcome.is_reportable() {
            collect_artifacts(
                workspace.path(),
                &task.settings.output_artifacts,
                &state.captured,
                &mut state.data,
            )
        } else {
            Vec::new()
        };

        info!(task_id = %task.id, outcome = %outcome, artifacts = artifacts.len(), "Execution finished");

        ExecutionResult {
            task_id: task.id.clone(),
            outcome,
            commands: state.commands,
            data: state.data,
            artifacts,
            duration: started.elapsed(),
            workspace: Some(workspace),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use fatman_core::CommandSpec;

    fn executor(root: &Path, timeout: Duration) -> ProcessExecutor {
        ProcessExecutor::new(root, timeout)
    }

    fn sh(name: &str, script: &str) -> CommandSpec {
        CommandSpec::new(name, "sh").arg("-c").arg(script)
    }

    async fn run(executor: &ProcessExecutor, task: &Task) -> ExecutionResult {
        let workspace = executor.prepare(task).unwrap();
        executor.run(task, workspace, CancellationToken::new()).await
    }

    #[tokio::test]
    async fn test_successful_commands_capture_output() {
        let root = tempfile::tempdir().unwrap();
        let exec = executor(root.path(), Duration::from_secs(10));
        let task = Task::new("t1")
            .with_command(sh("first", "echo hello; echo oops >&2"))
            .with_command(sh("second", "echo $GREETING > result.txt"))
            .with_env("GREETING", "hi")
            .with_output_artifact("*.txt");

        let result = run(&exec, &task).await;

        assert_eq!(result.outcome, Outcome::Succeeded);
        assert_eq!(result.commands.len(), 2);
        assert!(result.commands.iter().all(|c| c.exit_code == Some(0)));
        let names: Vec<&str> = result.artifacts.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["first.err", "first.out", "result.txt"]);
        let dir = result.workspace_path().unwrap();
        assert_eq!(std::fs::read_to_string(dir.join("first.out")).unwrap(), "hello\n");
        assert_eq!(std::fs::read_to_string(dir.join("result.txt")).unwrap(), "hi\n");
    }

    #[tokio::test]
    async fn test_failing_command_stops_the_task() {
        let root = tempfile::tempdir().unwrap();
        let exec = executor(root.path(), Duration::from_secs(10));
        let task = Task::new("t1")
            .with_command(sh("bad", "exit 3"))
            .with_command(sh("never", "touch never"));

        let result = run(&exec, &task).await;

        assert!(matches!(result.outcome, Outcome::Failed(_)));
        assert_eq!(result.commands.len(), 1);
        assert_eq!(result.commands[0].exit_code, Some(3));
        assert_eq!(result.data.errors[0].returncode, Some(3));
        assert!(!result.workspace_path().unwrap().join("never").exists());
    }

    #[tokio::test]
    async fn test_ignored_returncode_is_a_warning() {
        let root = tempfile::tempdir().unwrap();
        let exec = executor(root.path(), Duration::from_secs(10));
        let task = Task::new("t1")
            .with_command(sh("grep", "exit 1").ignoring_returncode())
            .with_command(sh("after", "true"));

        let result = run(&exec, &task).await;

        assert_eq!(result.outcome, Outcome::Succeeded);
        assert_eq!(result.commands.len(), 2);
        assert_eq!(result.data.warnings.len(), 1);
        assert!(result.data.errors.is_empty());
    }

    #[tokio::test]
    async fn test_missing_executable_fails() {
        let root = tempfile::tempdir().unwrap();
        let exec = executor(root.path(), Duration::from_secs(10));
        let task = Task::new("t1").with_command(CommandSpec::new("x", "/nonexistent/fatman-binary"));

        let result = run(&exec, &task).await;

        assert!(matches!(result.outcome, Outcome::Failed(_)));
        assert_eq!(result.commands[0].exit_code, None);
        assert!(result.data.errors[0].msg.starts_with("error occurred while running"));
    }

    #[tokio::test]
    async fn test_timeout_is_an_outcome() {
        let root = tempfile::tempdir().unwrap();
        let exec = executor(root.path(), Duration::from_millis(200));
        let task = Task::new("t1").with_command(CommandSpec::new("slow", "sleep").arg("30"));

        let started = Instant::now();
        let result = run(&exec, &task).await;

        assert_eq!(result.outcome, Outcome::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(result.data.errors[0].tag, "timeout");
    }

    #[tokio::test]
    async fn test_cancellation_stops_execution() {
        let root = tempfile::tempdir().unwrap();
        let exec = executor(root.path(), Duration::from_secs(60));
        let task = Task::new("t1").with_command(CommandSpec::new("slow", "sleep").arg("30"));
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let workspace = exec.prepare(&task).unwrap();
        let result = exec.run(&task, workspace, cancel).await;

        assert_eq!(result.outcome, Outcome::Cancelled);
        assert!(result.artifacts.is_empty());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_unknown_runner_fails_without_running() {
        let root = tempfile::tempdir().unwrap();
        let exec = executor(root.path(), Duration::from_secs(10));
        let task = Task::new("t1")
            .with_runner("slurm")
            .with_command(sh("never", "touch never"));

        let result = run(&exec, &task).await;

        assert!(matches!(result.outcome, Outcome::Failed(_)));
        assert!(result.commands.is_empty());
        assert_eq!(result.data.errors[0].tag, "runner");
    }

    #[tokio::test]
    async fn test_discard_removes_workspace() {
        let root = tempfile::tempdir().unwrap();
        let exec = executor(root.path(), Duration::from_secs(10));
        let task = Task::new("t1").with_command(sh("a", "echo x > file"));

        let result = run(&exec, &task).await;
        let dir = result.workspace_path().unwrap().to_path_buf();
        assert!(dir.join("file").exists());

        result.discard();
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_concurrent_tasks_do_not_share_scratch_space() {
        let root = tempfile::tempdir().unwrap();
        let exec = executor(root.path(), Duration::from_secs(10));
        let a = Task::new("a").with_command(sh("w", "echo a > shared.txt; sleep 0.2; cat shared.txt"));
        let b = Task::new("b").with_command(sh("w", "echo b > shared.txt; sleep 0.2; cat shared.txt"));

        let (ra, rb) = tokio::join!(run(&exec, &a), run(&exec, &b));

        let out_a = std::fs::read_to_string(ra.workspace_path().unwrap().join("w.out")).unwrap();
        let out_b = std::fs::read_to_string(rb.workspace_path().unwrap().join("w.out")).unwrap();
        assert_eq!(out_a, "a\n");
        assert_eq!(out_b, "b\n");
        assert_ne!(ra.workspace_path(), rb.workspace_path());
    }
}
