//! Client library for the FATMAN task API.
//!
//! Provides the HTTP client shared by `fdaemon` and `fclient`.

pub mod error;
pub mod http;

pub use error::{classify_status, ClientError};
pub use http::{ApiClient, ClientOptions, TaskQuery, TASKS_PATH};
