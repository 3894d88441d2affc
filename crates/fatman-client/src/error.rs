//! Error types for the FATMAN API client.

use fatman_core::ErrorKind;
use thiserror::Error;

/// Errors that can occur when talking to the FATMAN server.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport-level HTTP failure (connect, timeout, body).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("HTTP {status} from {url}: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },

    /// The configured or linked URL is not usable.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// The resource lacks a link the operation needs.
    #[error("missing link '{link}' on task {task_id}")]
    MissingLink { link: &'static str, task_id: String },

    /// Local file error while downloading or uploading.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ClientError {
    /// HTTP status code, if the server answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Classify the error for retry decisions.
    pub fn kind(&self) -> ErrorKind {
        if let Some(status) = self.status() {
            return classify_status(status);
        }
        match self {
            Self::Http(e) if e.is_builder() || e.is_decode() => ErrorKind::Permanent,
            Self::Http(_) | Self::Io(_) => ErrorKind::Transient,
            // the same document will not decode on a retry either
            Self::Serialization(_) => ErrorKind::Permanent,
            Self::InvalidUrl(_) | Self::MissingLink { .. } => ErrorKind::Permanent,
            Self::Status { status, .. } => classify_status(*status),
        }
    }
}

/// Map an HTTP status code to an error kind.
pub fn classify_status(status: u16) -> ErrorKind {
    match status {
        401 | 403 => ErrorKind::Auth,
        409 | 410 => ErrorKind::Conflict,
        408 | 429 => ErrorKind::Transient,
        500..=599 => ErrorKind::Transient,
        _ => ErrorKind::Permanent,
    }
}
