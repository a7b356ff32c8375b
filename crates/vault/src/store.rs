//! Persistence contract consumed by the encryption core.
//!
//! The core treats storage as a keyed durable map split into named stores,
//! with ordered iteration and atomic write batches. It never assumes any
//! query capability beyond that.

use {async_trait::async_trait, serde_json::Value};

use crate::error::Result;

/// Logical stores making up the persisted layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StoreName {
    /// Wrapped master key and device salt.
    Keys,
    /// Application records, plaintext (legacy) or encrypted.
    Records,
    /// Backup snapshots, keyed so that key order is timestamp order.
    Backups,
    /// Small flags such as migration completion.
    Meta,
}

impl StoreName {
    pub const ALL: [Self; 4] = [Self::Keys, Self::Records, Self::Backups, Self::Meta];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Keys => "keys",
            Self::Records => "records",
            Self::Backups => "backups",
            Self::Meta => "meta",
        }
    }
}

impl std::fmt::Display for StoreName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Well-known keys in [`StoreName::Keys`] and [`StoreName::Meta`].
pub mod keys {
    pub const MASTER_KEY_WRAPPED: &str = "MASTER_KEY_WRAPPED";
    pub const DEVICE_SALT: &str = "DEVICE_SALT";
    pub const MIGRATION_STATE: &str = "MIGRATION_STATE";
}

/// A single mutation inside a [`WriteBatch`].
#[derive(Debug, Clone)]
pub enum WriteOp {
    Put {
        store: StoreName,
        key: String,
        value: Value,
    },
    Delete {
        store: StoreName,
        key: String,
    },
}

/// Mutations applied atomically: either all land or none do.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, store: StoreName, key: impl Into<String>, value: Value) -> &mut Self {
        self.ops.push(WriteOp::Put {
            store,
            key: key.into(),
            value,
        });
        self
    }

    pub fn delete(&mut self, store: StoreName, key: impl Into<String>) -> &mut Self {
        self.ops.push(WriteOp::Delete {
            store,
            key: key.into(),
        });
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Durable, transactional key-value storage.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Verify the backend is reachable and writable.
    async fn ping(&self) -> Result<()>;
    async fn get(&self, store: StoreName, key: &str) -> Result<Option<Value>>;
    async fn put(&self, store: StoreName, key: &str, value: &Value) -> Result<()>;
    /// Returns whether an entry was removed.
    async fn delete(&self, store: StoreName, key: &str) -> Result<bool>;
    /// All entries of a store in ascending key order.
    async fn get_all(&self, store: StoreName) -> Result<Vec<(String, Value)>>;
    /// Apply every operation of `batch` in one transaction.
    async fn apply(&self, batch: WriteBatch) -> Result<()>;
}
