//! FATMAN calculation runner daemon.
//!
//! Polls the FATMAN server for pending tasks, claims them, executes them in
//! isolated working scopes and reports the results back.

pub mod backoff;
pub mod config;
pub mod error;
pub mod executor;
pub mod reporter;
pub mod transport;
pub mod work_loop;
pub mod workspace;

#[cfg(test)]
mod testing;

pub use config::{Config, ConfigError, DaemonArgs};
pub use error::{DaemonError, TransportError};
pub use executor::{ExecutionResult, ProcessExecutor, TaskExecutor};
pub use reporter::{Delivery, ResultReporter};
pub use transport::{Heartbeat, HttpTransport, Submission, TaskTransport};
pub use work_loop::{LoopSettings, WorkLoop};
