//! Error taxonomy for the workspace execution service.
//!
//! Every component raises a tagged [`ServiceError`] locally; the dispatcher
//! maps known variants onto the `error` field of the result envelope and an
//! HTTP status code, leaving anything else to bubble up as a 500.

use axum::http::StatusCode;
use std::path::PathBuf;

/// A tagged error from any component of the service.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid mode: {0}")]
    InvalidMode(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("command too long ({len} bytes). maximum allowed: {max} bytes")]
    CommandTooLong { len: usize, max: usize },

    #[error("session {0} has not started")]
    NotStarted(u32),

    #[error("session {0} is busy running '{1}'")]
    Busy(u32, String),

    #[error("{0}")]
    NotFound(String),

    #[error("path is not a file: {0}")]
    NotFile(PathBuf),

    #[error("path is not a directory: {0}")]
    NotDirectory(PathBuf),

    #[error("already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("directory not empty: {0}")]
    NotEmpty(PathBuf),

    #[error("no undo history for {0}")]
    NoHistory(PathBuf),

    #[error("out of range: {0}")]
    OutOfRange(String),

    #[error("multiple occurrences found; set all_occurrences=true to replace all")]
    Ambiguous,

    #[error("session {0} timed out after {1} seconds")]
    Timeout(u32, f64),

    #[error("stream error: {0}")]
    StreamError(String),

    #[error("session {0} must be restarted (process exited)")]
    ProcessExited(u32),

    #[error("io error: {0}")]
    IoError(String),
}

impl ServiceError {
    /// Maps an error onto the HTTP status the dispatcher returns for it.
    ///
    /// Request/state errors are client-correctable (400); anything else
    /// bubbles as a 500.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::InvalidPath(_)
            | ServiceError::InvalidMode(_)
            | ServiceError::InvalidArguments(_)
            | ServiceError::CommandTooLong { .. }
            | ServiceError::NotStarted(_)
            | ServiceError::Busy(_, _)
            | ServiceError::NotFound(_)
            | ServiceError::NotFile(_)
            | ServiceError::NotDirectory(_)
            | ServiceError::AlreadyExists(_)
            | ServiceError::NotEmpty(_)
            | ServiceError::NoHistory(_)
            | ServiceError::OutOfRange(_)
            | ServiceError::Ambiguous => StatusCode::BAD_REQUEST,
            ServiceError::Timeout(_, _)
            | ServiceError::StreamError(_)
            | ServiceError::ProcessExited(_)
            | ServiceError::IoError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<std::io::Error> for ServiceError {
    fn from(e: std::io::Error) -> Self {
        ServiceError::IoError(e.to_string())
    }
}
