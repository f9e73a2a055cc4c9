//! In-memory storage implementation.
//!
//! Provides a thread-safe in-memory backend for testing and single-process
//! clusters.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::time::SystemTime;

use super::{DocumentStore, StorageError, StoredDocument};

/// In-memory storage backend.
///
/// Data is not persisted across restarts. Share one instance through an
/// `Arc` to simulate several nodes on the same cluster store.
pub struct InMemoryStore {
    indices: RwLock<HashMap<String, BTreeMap<String, StoredDocument>>>,
}

impl InMemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            indices: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn put(&self, index: &str, id: &str, source: Value) -> Result<i64, StorageError> {
        let mut indices = self.indices.write().map_err(|_| StorageError::LockPoisoned)?;
        let docs = indices.entry(index.to_string()).or_default();
        let version = docs.get(id).map_or(1, |d| d.version + 1);
        docs.insert(
            id.to_string(),
            StoredDocument {
                id: id.to_string(),
                version,
                source,
                updated_at: SystemTime::now(),
            },
        );
        Ok(version)
    }

    async fn get(&self, index: &str, id: &str) -> Result<Option<StoredDocument>, StorageError> {
        let indices = self.indices.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(indices.get(index).and_then(|docs| docs.get(id)).cloned())
    }

    async fn delete(&self, index: &str, id: &str) -> Result<bool, StorageError> {
        let mut indices = self.indices.write().map_err(|_| StorageError::LockPoisoned)?;
        Ok(indices
            .get_mut(index)
            .and_then(|docs| docs.remove(id))
            .is_some())
    }

    async fn list(&self, index: &str) -> Result<Vec<StoredDocument>, StorageError> {
        let indices = self.indices.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(indices
            .get(index)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default())
    }
}
