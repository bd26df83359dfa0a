//! Error types for task ID parsing.

use thiserror::Error;

/// Errors that can occur when parsing task IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("task ID cannot be empty")]
    Empty,

    /// The ID contains characters that cannot appear in a store path.
    #[error("invalid task ID format: {message}")]
    InvalidFormat { message: String },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }
}
