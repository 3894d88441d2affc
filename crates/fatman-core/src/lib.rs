//! FATMAN Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/HTTP
//! - Runtime specifics
//!
//! All types here represent the task model shared by `fdaemon` and `fclient`.

pub mod error;
pub mod ids;
pub mod lease;
pub mod paths;
pub mod result;
pub mod retry;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use error::CoreError;
pub use ids::{TaskId, WorkerId};
pub use lease::ClaimLease;
pub use paths::{is_relative_inside, join_inside};
pub use result::{CommandStatus, Diagnostic, Outcome, TaskData};
pub use retry::{ErrorKind, RetryDecision, RetryPolicy};
pub use status::{SlotState, TaskStatus};
pub use task::{CommandSpec, Environment, FileLinks, FileRef, MachineSettings, Task, TaskLinks, TaskSettings};
