//! SQLite-backed key-value store.

use std::path::Path;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tracing::info;

use super::kv::{KvStore, StorageError};

/// Durable store: one `kv` table, whole-blob values.
#[derive(Clone)]
pub struct SqliteKv {
    pool: SqlitePool,
}

impl SqliteKv {
    /// Open (creating if needed) the database at `db_path`.
    pub async fn open(db_path: &str) -> Result<Self, StorageError> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db_url = format!("sqlite:{}?mode=rwc", db_path);
        info!("Opening planner database: {}", db_path);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect(&db_url)
            .await?;
        init_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// Open a throwaway in-memory database.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        init_schema(&pool).await?;
        Ok(Self { pool })
    }
}

async fn init_schema(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("CREATE TABLE IF NOT EXISTS kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)")
        .execute(pool)
        .await?;
    Ok(())
}

impl KvStore for SqliteKv {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM kv WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = ?2",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM kv WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
