//! SQLite-backed key-value store.
//!
//! The engine treats persistence as a flat key-value map keyed by strings
//! like `antiRaid_<guildId>.threshold`. Values are stored as JSON text so
//! callers can round-trip structured data through the typed helpers.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::error::{GatewardenError, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kv_entries (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
";

/// Key-value store over a SQLite connection pool.
#[derive(Clone)]
pub struct KvStore {
    pool: SqlitePool,
}

impl KvStore {
    /// Open (or create) the store at the given path.
    pub async fn open(path: &str) -> Result<Self> {
        let db_path = Path::new(path);

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    GatewardenError::Database(format!("Failed to create database directory: {}", e))
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| {
                GatewardenError::Database(format!("Failed to connect to database: {}", e))
            })?;

        let store = Self { pool };
        store.initialize_schema().await?;

        Ok(store)
    }

    /// Create an in-memory store for testing.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| {
                GatewardenError::Database(format!("Failed to create in-memory db: {}", e))
            })?;

        let store = Self { pool };
        store.initialize_schema().await?;

        Ok(store)
    }

    async fn initialize_schema(&self) -> Result<()> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                GatewardenError::Database(format!("Failed to initialize schema: {}", e))
            })?;

        Ok(())
    }

    /// Check if the store is healthy.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| GatewardenError::Database(format!("Health check failed: {}", e)))?;

        Ok(())
    }

    /// Get a raw value by key.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM kv_entries WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| GatewardenError::Database(format!("Failed to get {}: {}", key, e)))?;

        Ok(row.map(|r| r.get::<String, _>("value")))
    }

    /// Set a raw value, replacing any existing entry.
    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO kv_entries (key, value, updated_at)
             VALUES (?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = CURRENT_TIMESTAMP",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| GatewardenError::Database(format!("Failed to set {}: {}", key, e)))?;

        Ok(())
    }

    /// Delete an entry. Deleting an absent key is not an error.
    pub async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv_entries WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| GatewardenError::Database(format!("Failed to delete {}: {}", key, e)))?;

        Ok(())
    }

    /// List every entry in the store, ordered by key.
    pub async fn list_all(&self) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query("SELECT key, value FROM kv_entries ORDER BY key")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| GatewardenError::Database(format!("Failed to list entries: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>("key"), r.get::<String, _>("value")))
            .collect())
    }

    /// Get a value and deserialize it from JSON.
    ///
    /// Returns `Ok(None)` both when the key is absent and when the stored
    /// value fails to parse; a corrupt entry is logged and treated as absent
    /// so the engine stays live.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(raw) = self.get(key).await? else {
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!(key = key, error = %e, "Discarding unparseable stored value");
                Ok(None)
            }
        }
    }

    /// Serialize a value to JSON and store it.
    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.set(key, &raw).await
    }
}
