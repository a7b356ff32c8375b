//! In-memory [`KeyValueStore`] for tests and ephemeral use.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Mutex,
};

use {async_trait::async_trait, serde_json::Value};

use crate::{
    error::{Result, VaultError},
    store::{KeyValueStore, StoreName, WriteBatch, WriteOp},
};

type Stores = HashMap<StoreName, BTreeMap<String, Value>>;

/// `BTreeMap`-backed store. Nothing is persisted.
///
/// An optional byte quota (measured on serialized values) lets callers
/// exercise the [`VaultError::QuotaExceeded`] path.
#[derive(Default)]
pub struct MemoryStore {
    stores: Mutex<Stores>,
    quota_bytes: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject writes once serialized values would exceed `bytes`.
    pub fn with_quota(bytes: usize) -> Self {
        Self {
            stores: Mutex::new(HashMap::new()),
            quota_bytes: Some(bytes),
        }
    }

    fn check_quota(&self, stores: &Stores) -> Result<()> {
        let Some(limit) = self.quota_bytes else {
            return Ok(());
        };
        let used: usize = stores
            .values()
            .flat_map(|s| s.values())
            .map(|v| v.to_string().len())
            .sum();
        if used > limit {
            return Err(VaultError::QuotaExceeded(format!(
                "{used} bytes exceeds in-memory quota of {limit}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, store: StoreName, key: &str) -> Result<Option<Value>> {
        let stores = self.stores.lock().unwrap_or_else(|e| e.into_inner());
        Ok(stores.get(&store).and_then(|s| s.get(key)).cloned())
    }

    async fn put(&self, store: StoreName, key: &str, value: &Value) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(store, key, value.clone());
        self.apply(batch).await
    }

    async fn delete(&self, store: StoreName, key: &str) -> Result<bool> {
        let mut stores = self.stores.lock().unwrap_or_else(|e| e.into_inner());
        Ok(stores
            .get_mut(&store)
            .is_some_and(|s| s.remove(key).is_some()))
    }

    async fn get_all(&self, store: StoreName) -> Result<Vec<(String, Value)>> {
        let stores = self.stores.lock().unwrap_or_else(|e| e.into_inner());
        Ok(stores
            .get(&store)
            .map(|s| s.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn apply(&self, batch: WriteBatch) -> Result<()> {
        let mut stores = self.stores.lock().unwrap_or_else(|e| e.into_inner());
        // Stage on a copy so a quota failure leaves nothing applied.
        let mut staged = stores.clone();
        for op in batch.into_ops() {
            match op {
                WriteOp::Put { store, key, value } => {
                    staged.entry(store).or_default().insert(key, value);
                },
                WriteOp::Delete { store, key } => {
                    if let Some(s) = staged.get_mut(&store) {
                        s.remove(&key);
                    }
                },
            }
        }
        self.check_quota(&staged)?;
        *stores = staged;
        Ok(())
    }
}
