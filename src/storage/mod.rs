//! Document storage for job configs and trigger state.
//!
//! The scheduler reads job config documents from a config index and keeps
//! one trigger state document per owned job in a state index. Both live
//! behind the [`DocumentStore`] trait with pluggable backends (in-memory,
//! SQLite).

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::InMemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use serde_json::Value;
use std::time::SystemTime;
use thiserror::Error;

use crate::core::trigger::TriggerState;
use crate::core::types::JobKey;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Storage lock was poisoned.
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// The backend is unreachable.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Generic storage error.
    #[error("storage error: {0}")]
    Other(String),
}

/// A document as stored in an index.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: String,
    /// Starts at 1 and increments on every write.
    pub version: i64,
    pub source: Value,
    pub updated_at: SystemTime,
}

/// Versioned key/value document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create or replace a document. Returns the new version.
    async fn put(&self, index: &str, id: &str, source: Value) -> Result<i64, StorageError>;

    /// Get a document, if present.
    async fn get(&self, index: &str, id: &str) -> Result<Option<StoredDocument>, StorageError>;

    /// Delete a document. Returns whether it existed.
    async fn delete(&self, index: &str, id: &str) -> Result<bool, StorageError>;

    /// All documents of an index, ordered by id. A missing index is empty.
    async fn list(&self, index: &str) -> Result<Vec<StoredDocument>, StorageError>;
}

/// Load the persisted trigger state of a job.
pub async fn load_trigger_state(
    store: &dyn DocumentStore,
    state_index: &str,
    key: &JobKey,
) -> Result<Option<TriggerState>, StorageError> {
    let Some(doc) = store.get(state_index, &key.state_document_id()).await? else {
        return Ok(None);
    };
    serde_json::from_value(doc.source)
        .map(Some)
        .map_err(|e| StorageError::SerializationError(e.to_string()))
}

/// Persist the trigger state of a job.
pub async fn save_trigger_state(
    store: &dyn DocumentStore,
    state_index: &str,
    key: &JobKey,
    state: &TriggerState,
) -> Result<(), StorageError> {
    let source =
        serde_json::to_value(state).map_err(|e| StorageError::SerializationError(e.to_string()))?;
    store
        .put(state_index, &key.state_document_id(), source)
        .await?;
    Ok(())
}

/// Remove the persisted trigger state of a job.
pub async fn delete_trigger_state(
    store: &dyn DocumentStore,
    state_index: &str,
    key: &JobKey,
) -> Result<(), StorageError> {
    store.delete(state_index, &key.state_document_id()).await?;
    Ok(())
}
