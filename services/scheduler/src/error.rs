//! Scheduler error types.

use berth_ports::PortError;

use crate::store::StoreError;

/// Result type for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors that can occur while scheduling.
///
/// Insufficient resources and placement rejections are not errors; they
/// leave the task pending.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("port allocation error: {0}")]
    Ports(#[from] PortError),

    #[error("invalid task definition '{name}': {reason}")]
    InvalidDefinition { name: String, reason: String },

    #[error("invalid offer {offer_id}: {reason}")]
    InvalidOffer { offer_id: String, reason: String },

    #[error("unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("task type '{0}' does not allow scaling")]
    ScalingNotAllowed(String),

    #[error("cannot scale '{name}' to {requested}: minimum is {minimum}")]
    BelowMinimum {
        name: String,
        requested: u32,
        minimum: u32,
    },

    #[error("task not running: {0}")]
    TaskNotRunning(String),

    #[error("task not scaleable: {0}")]
    NotScaleable(String),
}
