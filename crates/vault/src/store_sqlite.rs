//! SQLite-backed [`KeyValueStore`] using sqlx.

use std::time::{SystemTime, UNIX_EPOCH};

use {
    async_trait::async_trait,
    serde_json::Value,
    sqlx::{SqlitePool, sqlite::SqlitePoolOptions},
};

use crate::{
    error::{Result, VaultError},
    store::{KeyValueStore, StoreName, WriteBatch, WriteOp},
};

/// `SQLITE_FULL` primary result code.
const SQLITE_FULL: &str = "13";

/// Single-table key-value store: `kv_entries(store, key, value, updated_at)`.
pub struct SqliteStore {
    pool: SqlitePool,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Distinguish capacity rejections from other database failures.
fn map_write_err(err: sqlx::Error) -> VaultError {
    if let sqlx::Error::Database(db) = &err
        && db.code().as_deref() == Some(SQLITE_FULL)
    {
        return VaultError::QuotaExceeded(db.message().to_string());
    }
    VaultError::Database(err)
}

impl SqliteStore {
    /// Open (creating if needed) a database and run migrations.
    ///
    /// For shared pools use [`SqliteStore::with_pool`] after calling
    /// [`crate::run_migrations`].
    pub async fn open(database_url: &str) -> Result<Self> {
        // Every connection to `:memory:` is its own database.
        let options = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = options
            .connect(database_url)
            .await
            .map_err(|e| VaultError::EncryptionSupport(format!("cannot open storage: {e}")))?;

        crate::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    /// Open an existing database without creating or migrating anything.
    /// Pass a `mode=ro` URL to also refuse writes.
    pub async fn open_existing(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await
            .map_err(|e| VaultError::EncryptionSupport(format!("cannot open storage: {e}")))?;
        Ok(Self { pool })
    }

    /// Create a store over an existing, already migrated pool.
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1 FROM kv_entries LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| VaultError::EncryptionSupport(format!("storage unavailable: {e}")))?;
        Ok(())
    }

    async fn get(&self, store: StoreName, key: &str) -> Result<Option<Value>> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT value FROM kv_entries WHERE store = ? AND key = ?")
                .bind(store.as_str())
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(raw.map(|s| serde_json::from_str(&s)).transpose()?)
    }

    async fn put(&self, store: StoreName, key: &str, value: &Value) -> Result<()> {
        sqlx::query(
            "INSERT INTO kv_entries (store, key, value, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(store, key) DO UPDATE SET
               value = excluded.value,
               updated_at = excluded.updated_at",
        )
        .bind(store.as_str())
        .bind(key)
        .bind(serde_json::to_string(value)?)
        .bind(now_ms())
        .execute(&self.pool)
        .await
        .map_err(map_write_err)?;
        Ok(())
    }

    async fn delete(&self, store: StoreName, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM kv_entries WHERE store = ? AND key = ?")
            .bind(store.as_str())
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_all(&self, store: StoreName) -> Result<Vec<(String, Value)>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, value FROM kv_entries WHERE store = ? ORDER BY key")
                .bind(store.as_str())
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|(key, raw)| Ok((key, serde_json::from_str(&raw)?)))
            .collect()
    }

    async fn apply(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        let now = now_ms();
        for op in batch.into_ops() {
            match op {
                WriteOp::Put { store, key, value } => {
                    sqlx::query(
                        "INSERT INTO kv_entries (store, key, value, updated_at) VALUES (?, ?, ?, ?)
                         ON CONFLICT(store, key) DO UPDATE SET
                           value = excluded.value,
                           updated_at = excluded.updated_at",
                    )
                    .bind(store.as_str())
                    .bind(&key)
                    .bind(serde_json::to_string(&value)?)
                    .bind(now)
                    .execute(&mut *tx)
                    .await
                    .map_err(map_write_err)?;
                },
                WriteOp::Delete { store, key } => {
                    sqlx::query("DELETE FROM kv_entries WHERE store = ? AND key = ?")
                        .bind(store.as_str())
                        .bind(&key)
                        .execute(&mut *tx)
                        .await?;
                },
            }
        }
        // Dropping `tx` on an early return rolls everything back.
        tx.commit().await.map_err(map_write_err)?;
        Ok(())
    }
}
