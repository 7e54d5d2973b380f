use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tokio::sync::Mutex;

/// One mutation inside an atomic [`BlobStore::apply`] batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl BlobOp {
    pub fn put(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }
}

/// Named byte blobs persisted across process restarts.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;
    /// Applies every op or none of them.
    async fn apply(&self, ops: Vec<BlobOp>) -> Result<()>;
    /// Drops every blob this store holds.
    async fn clear_all(&self) -> Result<()>;

    async fn save(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.apply(vec![BlobOp::put(key, value)]).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.apply(vec![BlobOp::delete(key)]).await
    }
}

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.blobs.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.lock().await.get(key).cloned())
    }

    async fn apply(&self, ops: Vec<BlobOp>) -> Result<()> {
        let mut guard = self.blobs.lock().await;
        for op in ops {
            match op {
                BlobOp::Put { key, value } => {
                    guard.insert(key, value);
                }
                BlobOp::Delete { key } => {
                    guard.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn clear_all(&self) -> Result<()> {
        self.blobs.lock().await.clear();
        Ok(())
    }
}

#[derive(Clone)]
pub struct SqliteBlobStore {
    pool: Pool<Sqlite>,
}

impl SqliteBlobStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every in-memory connection is its own database.
        let max_connections = if sqlite_path(database_url).is_none() {
            1
        } else {
            5
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open blob store at '{database_url}'"))?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }
}

#[async_trait]
impl BlobStore for SqliteBlobStore {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT value FROM blobs WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to load blob '{key}'"))?;
        Ok(row.map(|r| r.get::<Vec<u8>, _>(0)))
    }

    async fn apply(&self, ops: Vec<BlobOp>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for op in ops {
            match op {
                BlobOp::Put { key, value } => {
                    sqlx::query(
                        "INSERT INTO blobs (key, value) VALUES (?, ?)
                         ON CONFLICT(key) DO UPDATE SET
                             value = excluded.value,
                             updated_at = CURRENT_TIMESTAMP",
                    )
                    .bind(&key)
                    .bind(value)
                    .execute(&mut *tx)
                    .await
                    .with_context(|| format!("failed to write blob '{key}'"))?;
                }
                BlobOp::Delete { key } => {
                    sqlx::query("DELETE FROM blobs WHERE key = ?")
                        .bind(&key)
                        .execute(&mut *tx)
                        .await
                        .with_context(|| format!("failed to delete blob '{key}'"))?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn clear_all(&self) -> Result<()> {
        sqlx::query("DELETE FROM blobs")
            .execute(&self.pool)
            .await
            .context("failed to clear blob store")?;
        Ok(())
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
