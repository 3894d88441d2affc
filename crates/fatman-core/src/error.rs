//! Core domain errors.

use thiserror::Error;

/// Core domain errors for the FATMAN clients.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Invalid state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Unknown task status name.
    #[error("Unknown task status: {0}")]
    UnknownStatus(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
