//! Status enums for Tasks and worker slots.

use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Status of a Task on the server.
///
/// The server names these states differently from the daemon, so each
/// variant carries its wire name explicitly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Task created and waiting for a worker.
    #[default]
    #[serde(rename = "new")]
    Pending,
    /// Task claimed by a worker, inputs not yet running.
    #[serde(rename = "pending")]
    Claimed,
    /// Task executing on its worker.
    #[serde(rename = "running")]
    Running,
    /// Task completed successfully.
    #[serde(rename = "done")]
    Done,
    /// Task failed.
    #[serde(rename = "error")]
    Failed,
}

impl TaskStatus {
    /// The name the server uses for this status.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::Pending => "new",
            Self::Claimed => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "error",
        }
    }

    /// Parse a server-side status name.
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "new" => Some(Self::Pending),
            "pending" => Some(Self::Claimed),
            "running" => Some(Self::Running),
            "done" => Some(Self::Done),
            "error" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Returns true if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Returns true if a worker currently holds a claim on the task.
    pub fn is_claimed(&self) -> bool {
        matches!(self, Self::Claimed | Self::Running)
    }
}

impl FromStr for TaskStatus {
    type Err = CoreError;

    /// Accepts both the daemon's names and the server's wire names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claimed" => Ok(Self::Claimed),
            "failed" => Ok(Self::Failed),
            other => Self::from_wire(other)
                .ok_or_else(|| CoreError::UnknownStatus(other.to_string())),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// State of one execution slot in the daemon's worker pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SlotState {
    /// Waiting for work.
    #[default]
    Idle,
    /// Asking the server for a task.
    Claiming,
    /// Executing a claimed task.
    Running,
    /// Delivering the outcome of a task.
    Reporting,
}

impl SlotState {
    /// Whether moving from `self` to `next` follows the slot state machine.
    pub fn can_transition_to(&self, next: SlotState) -> bool {
        use SlotState::*;
        matches!(
            (self, next),
            (Idle, Claiming)
                | (Claiming, Idle)
                | (Claiming, Running)
                | (Running, Reporting)
                | (Running, Idle)
                | (Reporting, Idle)
        )
    }

    /// Move to `next`, rejecting transitions outside the state machine.
    pub fn transition(self, next: SlotState) -> Result<SlotState, CoreError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(CoreError::InvalidStateTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Claiming => "claiming",
            Self::Running => "running",
            Self::Reporting => "reporting",
        };
        f.write_str(name)
    }
}
