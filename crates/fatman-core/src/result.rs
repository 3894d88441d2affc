//! Execution outcome and diagnostics types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How the execution of a task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// All commands completed successfully.
    Succeeded,
    /// The task failed; the reason is also recorded in the diagnostics.
    Failed(String),
    /// The task exceeded its wall-clock limit and was terminated.
    TimedOut,
    /// Execution was abandoned, e.g. because the lease was lost.
    Cancelled,
}

impl Outcome {
    /// Whether this outcome should be reported to the server at all.
    pub fn is_reportable(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }

    /// Whether the task should end up `done` on the server.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => f.write_str("succeeded"),
            Self::Failed(reason) => write!(f, "failed: {}", reason),
            Self::TimedOut => f.write_str("timed_out"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Exit status of one command of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStatus {
    /// Command name.
    pub name: String,
    /// Exit code; `None` if the process was killed by a signal or never started.
    pub exit_code: Option<i32>,
}

/// A warning or error entry in the task's result document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Which part of the settings the entry refers to (`commands`, `output_artifacts`, ...).
    pub tag: String,
    /// Name of the offending entry.
    pub entry: String,
    /// Human readable message.
    pub msg: String,
    /// Exit code of the command, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returncode: Option<i32>,
}

impl Diagnostic {
    /// Create a new diagnostic without a return code.
    pub fn new(tag: impl Into<String>, entry: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            entry: entry.into(),
            msg: msg.into(),
            returncode: None,
        }
    }

    /// Builder method to attach a return code.
    pub fn with_returncode(mut self, code: i32) -> Self {
        self.returncode = Some(code);
        self
    }
}

/// The task's result document, as uploaded together with the terminal status.
///
/// Keys other than `warnings` and `errors` that were already present on the
/// server are preserved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskData {
    #[serde(default)]
    pub warnings: Vec<Diagnostic>,
    #[serde(default)]
    pub errors: Vec<Diagnostic>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TaskData {
    /// Start from the document already stored on the server.
    ///
    /// A missing or malformed document yields an empty one.
    pub fn from_existing(data: Option<&serde_json::Value>) -> Self {
        data.and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    /// Record a warning.
    pub fn warn(&mut self, diagnostic: Diagnostic) {
        self.warnings.push(diagnostic);
    }

    /// Record an error.
    pub fn error(&mut self, diagnostic: Diagnostic) {
        self.errors.push(diagnostic);
    }

    /// Serialize for the server.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
