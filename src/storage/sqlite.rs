//! SQLite storage implementation.
//!
//! Provides persistent storage using SQLite database.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::{DocumentStore, StorageError, StoredDocument};

/// SQLite storage backend.
///
/// Provides persistent storage with automatic schema migration.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a new SQLite store with the given database path.
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(|e| StorageError::Other(e.to_string()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory SQLite database (useful for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        let schema = include_str!("../../migrations/001_initial_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn system_time_to_string(time: SystemTime) -> String {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

fn string_to_system_time(s: &str) -> SystemTime {
    s.parse::<u64>()
        .ok()
        .map(|millis| UNIX_EPOCH + Duration::from_millis(millis))
        .unwrap_or(UNIX_EPOCH)
}

fn row_to_document(row: (String, i64, String, String)) -> Result<StoredDocument, StorageError> {
    let source: Value = serde_json::from_str(&row.2)
        .map_err(|e| StorageError::SerializationError(e.to_string()))?;
    Ok(StoredDocument {
        id: row.0,
        version: row.1,
        source,
        updated_at: string_to_system_time(&row.3),
    })
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn put(&self, index: &str, id: &str, source: Value) -> Result<i64, StorageError> {
        let source = serde_json::to_string(&source)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;

        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO documents (idx, id, version, source, updated_at)
            VALUES (?, ?, 1, ?, ?)
            ON CONFLICT (idx, id) DO UPDATE SET
                version = documents.version + 1,
                source = excluded.source,
                updated_at = excluded.updated_at
            RETURNING version
            "#,
        )
        .bind(index)
        .bind(id)
        .bind(source)
        .bind(system_time_to_string(SystemTime::now()))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))
    }

    async fn get(&self, index: &str, id: &str) -> Result<Option<StoredDocument>, StorageError> {
        let row: Option<(String, i64, String, String)> = sqlx::query_as(
            "SELECT id, version, source, updated_at FROM documents WHERE idx = ? AND id = ?",
        )
        .bind(index)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        row.map(row_to_document).transpose()
    }

    async fn delete(&self, index: &str, id: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM documents WHERE idx = ? AND id = ?")
            .bind(index)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, index: &str) -> Result<Vec<StoredDocument>, StorageError> {
        let rows: Vec<(String, i64, String, String)> = sqlx::query_as(
            "SELECT id, version, source, updated_at FROM documents WHERE idx = ? ORDER BY id",
        )
        .bind(index)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        rows.into_iter().map(row_to_document).collect()
    }
}
