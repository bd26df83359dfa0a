//! In-memory store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{segments, DurableStore, StoreError, StoreResult};

/// Store kept in a map from normalized path to node data.
#[derive(Debug, Default)]
pub struct MemoryStore {
    nodes: RwLock<BTreeMap<String, Option<Vec<u8>>>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with a connection loss.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self, path: &str) -> StoreResult<String> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::ConnectionLoss(path.to_string()));
        }
        Ok(normalize(&segments(path)?))
    }
}

fn normalize(parts: &[&str]) -> String {
    format!("/{}", parts.join("/"))
}

fn child_prefix(path: &str) -> String {
    if path == "/" {
        path.to_string()
    } else {
        format!("{}/", path)
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get_children(&self, path: &str) -> StoreResult<Vec<String>> {
        let path = self.check(path)?;
        let nodes = self.nodes.read().await;
        if path != "/" && !nodes.contains_key(&path) {
            return Err(StoreError::NotFound(path));
        }
        let prefix = child_prefix(&path);
        Ok(nodes
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(str::to_string)
            .collect())
    }

    async fn get_data(&self, path: &str) -> StoreResult<Option<Vec<u8>>> {
        let path = self.check(path)?;
        let nodes = self.nodes.read().await;
        nodes.get(&path).cloned().ok_or(StoreError::NotFound(path))
    }

    async fn set_data(&self, path: &str, data: &[u8]) -> StoreResult<()> {
        let path = self.check(path)?;
        let mut nodes = self.nodes.write().await;
        match nodes.get_mut(&path) {
            Some(node) => {
                *node = Some(data.to_vec());
                Ok(())
            }
            None => Err(StoreError::NotFound(path)),
        }
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        let path = self.check(path)?;
        let mut nodes = self.nodes.write().await;
        if nodes.remove(&path).is_none() {
            return Err(StoreError::NotFound(path));
        }
        let prefix = child_prefix(&path);
        nodes.retain(|key, _| !key.starts_with(&prefix));
        Ok(())
    }

    async fn mkdir_if_absent(&self, path: &str) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::ConnectionLoss(path.to_string()));
        }
        let parts = segments(path)?;
        let mut nodes = self.nodes.write().await;
        for depth in 1..=parts.len() {
            nodes.entry(normalize(&parts[..depth])).or_insert(None);
        }
        Ok(())
    }
}
