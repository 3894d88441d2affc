//! Daemon error types.

use fatman_client::ClientError;
use fatman_core::ErrorKind;
use thiserror::Error;

use crate::config::ConfigError;

/// Failure of a call to the server, classified for retry decisions.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Network or server unavailable.
    #[error("transport failure: {0}")]
    Transient(String),

    /// Credentials were rejected.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// The request was rejected as invalid (unknown task, payload too large, ...).
    #[error("request rejected: {0}")]
    Malformed(String),

    /// The server state moved on (claim race lost, lease reassigned).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl TransportError {
    /// Classify the error for retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) => ErrorKind::Transient,
            Self::Auth(_) => ErrorKind::Auth,
            Self::Malformed(_) => ErrorKind::Permanent,
            Self::Conflict(_) => ErrorKind::Conflict,
        }
    }
}

impl From<ClientError> for TransportError {
    fn from(e: ClientError) -> Self {
        let msg = e.to_string();
        match e.kind() {
            ErrorKind::Transient => Self::Transient(msg),
            ErrorKind::Auth => Self::Auth(msg),
            ErrorKind::Permanent => Self::Malformed(msg),
            ErrorKind::Conflict => Self::Conflict(msg),
        }
    }
}

/// Conditions that stop the whole daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// No task can proceed without valid credentials.
    #[error("authentication failed, check the configured token: {0}")]
    Auth(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Unrecoverable internal fault.
    #[error("internal fault: {0}")]
    Internal(String),
}

impl DaemonError {
    /// Process exit status for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Auth(_) | Self::Config(_) => 2,
            Self::Internal(_) => 1,
        }
    }
}
