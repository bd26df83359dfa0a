//! Filesystem store.
//!
//! Each node is a directory below the root. Node data lives in a `.data`
//! file inside the node's directory, so node names may not start with `.`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use super::{segments, DurableStore, StoreError, StoreResult};

const DATA_FILE: &str = ".data";

/// Store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub async fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        debug!(root = %root.display(), "Opened file store");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn node_dir(&self, path: &str) -> StoreResult<PathBuf> {
        let parts = segments(path)?;
        if parts.iter().any(|part| part.starts_with('.')) {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        Ok(parts.iter().fold(self.root.clone(), |dir, part| dir.join(part)))
    }

    async fn require_node(&self, path: &str, dir: &Path) -> StoreResult<()> {
        match fs::metadata(dir).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(StoreError::NotFound(path.to_string())),
            Err(e) => Err(not_found_or(e, path)),
        }
    }
}

fn not_found_or(err: std::io::Error, path: &str) -> StoreError {
    if err.kind() == ErrorKind::NotFound {
        StoreError::NotFound(path.to_string())
    } else {
        StoreError::Io(err)
    }
}

#[async_trait]
impl DurableStore for FileStore {
    async fn get_children(&self, path: &str) -> StoreResult<Vec<String>> {
        let dir = self.node_dir(path)?;
        let mut entries = fs::read_dir(&dir).await.map_err(|e| not_found_or(e, path))?;
        let mut children = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') && entry.file_type().await?.is_dir() {
                children.push(name);
            }
        }
        children.sort();
        Ok(children)
    }

    async fn get_data(&self, path: &str) -> StoreResult<Option<Vec<u8>>> {
        let dir = self.node_dir(path)?;
        self.require_node(path, &dir).await?;
        match fs::read(dir.join(DATA_FILE)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn set_data(&self, path: &str, data: &[u8]) -> StoreResult<()> {
        let dir = self.node_dir(path)?;
        self.require_node(path, &dir).await?;

        // Write then rename so readers never see a partial record.
        let staging = dir.join(".data.tmp");
        fs::write(&staging, data).await?;
        fs::rename(&staging, dir.join(DATA_FILE)).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        let dir = self.node_dir(path)?;
        if dir == self.root {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        fs::remove_dir_all(&dir)
            .await
            .map_err(|e| not_found_or(e, path))
    }

    async fn mkdir_if_absent(&self, path: &str) -> StoreResult<()> {
        let dir = self.node_dir(path)?;
        fs::create_dir_all(&dir).await?;
        Ok(())
    }
}
