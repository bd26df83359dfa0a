//! Error types for protocol messages.

use thiserror::Error;

/// Errors that can occur when decoding protocol messages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The task state name is unknown.
    #[error("unknown task state: {0}")]
    UnknownTaskState(String),

    /// The message could not be decoded.
    #[error("invalid message: {0}")]
    Decode(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Decode(err.to_string())
    }
}
