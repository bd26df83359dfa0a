//! Durable hierarchical store.
//!
//! Nodes are addressed by absolute, `/`-separated paths. Every node may hold
//! data and children. Two backends are provided:
//! - [`MemoryStore`], for tests and runs without persistence
//! - [`FileStore`], a directory tree on the local filesystem

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use thiserror::Error;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("node not found: {0}")]
    NotFound(String),

    #[error("store connection lost: {0}")]
    ConnectionLoss(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Path-addressed persistence.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Names of the direct children of `path`.
    async fn get_children(&self, path: &str) -> StoreResult<Vec<String>>;

    /// Data held by `path`, `None` if the node exists without data.
    async fn get_data(&self, path: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Replace the data of an existing node.
    async fn set_data(&self, path: &str, data: &[u8]) -> StoreResult<()>;

    /// Delete a node and everything below it.
    async fn delete(&self, path: &str) -> StoreResult<()>;

    /// Create `path` and any missing ancestors.
    async fn mkdir_if_absent(&self, path: &str) -> StoreResult<()>;
}

/// Split an absolute path into its segments.
pub(crate) fn segments(path: &str) -> StoreResult<Vec<&str>> {
    let Some(rest) = path.strip_prefix('/') else {
        return Err(StoreError::InvalidPath(path.to_string()));
    };
    let parts: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
    if parts.iter().any(|s| *s == "." || *s == "..") {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(parts)
}
