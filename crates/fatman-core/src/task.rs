//! Task types as served by the FATMAN task API.

use crate::{TaskId, TaskStatus, WorkerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A Task represents a unit of computational work created on the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,

    /// Current task status.
    pub status: TaskStatus,

    /// Worker currently owning the task, if any.
    #[serde(default)]
    pub machine: Option<WorkerId>,

    /// When the current claim was taken.
    #[serde(default, alias = "mtime")]
    pub claimed_at: Option<DateTime<Utc>>,

    /// What to run and how.
    #[serde(default)]
    pub settings: TaskSettings,

    /// Free-form result document; the daemon maintains `warnings` and `errors` in it.
    #[serde(default)]
    pub data: Option<serde_json::Value>,

    /// Input files to download before running.
    #[serde(default)]
    pub infiles: Vec<FileRef>,

    /// Output files already uploaded for this task.
    #[serde(default)]
    pub outfiles: Vec<FileRef>,

    /// Server-relative links to related resources.
    #[serde(rename = "_links", default)]
    pub links: TaskLinks,
}

impl Task {
    /// Create a new pending Task running the given commands directly.
    pub fn new(id: impl Into<TaskId>) -> Self {
        Self {
            id: id.into(),
            status: TaskStatus::Pending,
            machine: None,
            claimed_at: None,
            settings: TaskSettings::default(),
            data: None,
            infiles: Vec::new(),
            outfiles: Vec::new(),
            links: TaskLinks::default(),
        }
    }

    /// Builder method to add a command.
    pub fn with_command(mut self, command: CommandSpec) -> Self {
        self.settings.commands.push(command);
        self
    }

    /// Builder method to add an output artifact glob.
    pub fn with_output_artifact(mut self, pattern: impl Into<String>) -> Self {
        self.settings.output_artifacts.push(pattern.into());
        self
    }

    /// Builder method to select the runner.
    pub fn with_runner(mut self, runner: impl Into<String>) -> Self {
        self.settings.machine.runner = runner.into();
        self
    }

    /// Builder method to set an environment variable for all commands.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings
            .environment
            .variables
            .insert(key.into(), serde_json::Value::String(value.into()));
        self
    }

    /// Builder method to set the status.
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    /// The task kind, i.e. the name of the runner that executes it.
    pub fn kind(&self) -> &str {
        &self.settings.machine.runner
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Check if the task is claimed by the given worker.
    pub fn is_owned_by(&self, worker: &WorkerId) -> bool {
        self.status.is_claimed() && self.machine.as_ref() == Some(worker)
    }

    /// Whether an output file with this name was already uploaded.
    pub fn has_outfile(&self, name: &str) -> bool {
        self.outfiles.iter().any(|f| f.name == name)
    }
}

/// Execution settings of a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSettings {
    /// Machine-specific settings.
    #[serde(default)]
    pub machine: MachineSettings,

    /// Commands to run, in order.
    #[serde(default)]
    pub commands: Vec<CommandSpec>,

    /// Environment for all commands.
    #[serde(default)]
    pub environment: Environment,

    /// Glob patterns, relative to the working scope, of files to upload.
    #[serde(default)]
    pub output_artifacts: Vec<String>,
}

/// Machine-specific settings of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSettings {
    /// Runner used to execute the task.
    #[serde(default = "default_runner")]
    pub runner: String,
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self {
            runner: default_runner(),
        }
    }
}

fn default_runner() -> String {
    "direct".to_string()
}

/// One command of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Name, used for the `<name>.out` / `<name>.err` capture files.
    pub name: String,

    /// Executable.
    pub cmd: String,

    /// Arguments.
    #[serde(default)]
    pub args: Vec<serde_json::Value>,

    /// Treat a non-zero exit status as a warning instead of an error.
    #[serde(default)]
    pub ignore_returncode: bool,
}

impl CommandSpec {
    /// Create a new command.
    pub fn new(name: impl Into<String>, cmd: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cmd: cmd.into(),
            args: Vec::new(),
            ignore_returncode: false,
        }
    }

    /// Builder method to add an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(serde_json::Value::String(arg.into()));
        self
    }

    /// Builder method to ignore the exit status.
    pub fn ignoring_returncode(mut self) -> Self {
        self.ignore_returncode = true;
        self
    }

    /// Arguments as strings. Non-string JSON values are rendered as JSON.
    pub fn string_args(&self) -> Vec<String> {
        self.args.iter().map(render_value).collect()
    }
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Environment specification of a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    /// Environment modules to load.
    #[serde(default)]
    pub modules: Vec<String>,

    /// Variables injected into each command. Values may be any JSON scalar.
    #[serde(default)]
    pub variables: BTreeMap<String, serde_json::Value>,
}

impl Environment {
    /// Variables as strings, rendered like [`CommandSpec::string_args`].
    pub fn string_variables(&self) -> Vec<(String, String)> {
        self.variables
            .iter()
            .map(|(k, v)| (k.clone(), render_value(v)))
            .collect()
    }
}

/// Reference to a file stored on the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRef {
    /// File name, relative to the task's working scope.
    pub name: String,

    /// Links to the file's resources.
    #[serde(rename = "_links", default)]
    pub links: FileLinks,
}

/// Links of a stored file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileLinks {
    /// Download location.
    #[serde(default)]
    pub download: Option<String>,
}

/// Links of a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskLinks {
    /// The task resource itself.
    #[serde(rename = "self", default)]
    pub self_link: Option<String>,

    /// Upload endpoint for output artifacts.
    #[serde(default)]
    pub uploads: Option<String>,
}
