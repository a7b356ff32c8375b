//! Checksummed record snapshots with bounded retention.

use std::{
    fmt,
    path::Path,
    str::FromStr,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use {
    serde::{Deserialize, Serialize},
    serde_json::Value,
    sha2::{Digest, Sha256},
};

#[cfg(feature = "metrics")]
use recordseal_metrics::{backup as backup_metrics, counter};

use crate::{
    error::{Result, VaultError},
    record::{is_encrypted, record_id},
    store::{KeyValueStore, StoreName, WriteBatch, keys},
};

/// Why a backup was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupKind {
    Auto,
    Manual,
    PreMigration,
}

impl BackupKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
            Self::PreMigration => "pre-migration",
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupKind {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(Self::Auto),
            "manual" => Ok(Self::Manual),
            "pre-migration" => Ok(Self::PreMigration),
            other => Err(VaultError::BackupFailed(format!("unknown backup kind `{other}`"))),
        }
    }
}

/// A snapshot of records, trusted only while its checksum validates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    /// Zero-padded timestamp, so lexical order is chronological order.
    pub id: String,
    pub timestamp_ms: u64,
    pub kind: BackupKind,
    pub count: usize,
    /// Hex SHA-256 of the serialized `records`.
    pub checksum: String,
    pub records: Vec<Value>,
}

/// Checksum over the serialized record list.
pub fn records_checksum(records: &[Value]) -> Result<String> {
    let bytes = serde_json::to_vec(records)?;
    Ok(Sha256::digest(&bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect())
}

/// Recompute the checksum and compare. Never fails.
pub fn validate_backup(backup: &Backup) -> bool {
    backup.count == backup.records.len()
        && records_checksum(&backup.records).is_ok_and(|c| c == backup.checksum)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn backup_key(timestamp_ms: u64) -> String {
    format!("{timestamp_ms:020}")
}

pub struct BackupStore {
    store: Arc<dyn KeyValueStore>,
    retention: usize,
}

impl BackupStore {
    /// `retention` is clamped to at least one so a just-created backup is
    /// never pruned.
    pub fn new(store: Arc<dyn KeyValueStore>, retention: usize) -> Self {
        Self {
            store,
            retention: retention.max(1),
        }
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    /// Snapshot `records`, persist, read back and verify, then prune the
    /// oldest backups beyond the retention count.
    pub async fn create_backup(&self, records: &[Value], kind: BackupKind) -> Result<Backup> {
        let existing = self.store.get_all(StoreName::Backups).await?;

        // Keep keys strictly increasing even within one millisecond.
        let newest = existing
            .last()
            .and_then(|(key, _)| key.parse::<u64>().ok())
            .unwrap_or(0);
        let timestamp_ms = now_ms().max(newest + 1);
        let id = backup_key(timestamp_ms);

        let backup = Backup {
            id: id.clone(),
            timestamp_ms,
            kind,
            count: records.len(),
            checksum: records_checksum(records)?,
            records: records.to_vec(),
        };
        self.store
            .put(StoreName::Backups, &id, &serde_json::to_value(&backup)?)
            .await?;

        let stored = self.get(&id).await?;
        if !stored.as_ref().is_some_and(validate_backup) {
            return Err(VaultError::BackupFailed(format!(
                "backup {id} did not verify after write"
            )));
        }

        let total = existing.len() + 1;
        let excess = total.saturating_sub(self.retention);
        if excess > 0 {
            let mut batch = WriteBatch::new();
            for (key, _) in existing.iter().take(excess) {
                batch.delete(StoreName::Backups, key.as_str());
            }
            self.store.apply(batch).await?;
            #[cfg(feature = "metrics")]
            counter!(backup_metrics::PRUNED_TOTAL).increment(excess as u64);
            #[cfg(feature = "tracing")]
            tracing::debug!(pruned = excess, retention = self.retention, "pruned old backups");
        }

        #[cfg(feature = "metrics")]
        counter!(backup_metrics::CREATED_TOTAL, "kind" => kind.as_str()).increment(1);
        #[cfg(feature = "tracing")]
        tracing::info!(%id, %kind, count = backup.count, "backup created");

        Ok(backup)
    }

    /// All parseable backups, newest first.
    pub async fn list(&self) -> Result<Vec<Backup>> {
        let entries = self.store.get_all(StoreName::Backups).await?;
        let mut backups: Vec<Backup> = entries
            .into_iter()
            .filter_map(|(key, value)| match serde_json::from_value(value) {
                Ok(backup) => Some(backup),
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(%key, error = %e, "skipping unreadable backup");
                    #[cfg(not(feature = "tracing"))]
                    let _ = (key, e);
                    None
                },
            })
            .collect();
        backups.reverse();
        Ok(backups)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Backup>> {
        self.store
            .get(StoreName::Backups, id)
            .await?
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| VaultError::BackupFailed(format!("backup {id} is unreadable: {e}")))
    }

    pub async fn latest(&self) -> Result<Option<Backup>> {
        Ok(self.list().await?.into_iter().next())
    }

    /// Write every record of a valid backup back in one atomic batch.
    ///
    /// Records not in the backup are left alone. When plaintext records
    /// come back, the migration flag is cleared so they get migrated again.
    pub async fn restore(&self, backup: &Backup) -> Result<usize> {
        if !validate_backup(backup) {
            #[cfg(feature = "metrics")]
            counter!(backup_metrics::INVALID_TOTAL).increment(1);
            return Err(VaultError::BackupFailed(format!(
                "backup {} failed checksum validation",
                backup.id
            )));
        }

        let mut batch = WriteBatch::new();
        for record in &backup.records {
            let id = record_id(record)?;
            batch.put(StoreName::Records, id, record.clone());
        }
        if backup.records.iter().any(|r| !is_encrypted(r)) {
            batch.delete(StoreName::Meta, keys::MIGRATION_STATE);
        }
        self.store.apply(batch).await?;

        #[cfg(feature = "tracing")]
        tracing::info!(id = %backup.id, count = backup.count, "backup restored");
        Ok(backup.count)
    }

    /// Write `backup` as pretty JSON to `path`.
    pub async fn export_to_file(&self, backup: &Backup, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(backup)?;
        tokio::fs::write(path, json).await?;

        // Backups may hold plaintext legacy records.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await;
        }

        #[cfg(feature = "tracing")]
        tracing::info!(id = %backup.id, path = %path.display(), "backup exported");
        Ok(())
    }

    /// Read a backup file and verify it. Does not write anything.
    pub async fn restore_from_file(&self, path: &Path) -> Result<Backup> {
        let raw = tokio::fs::read(path).await?;
        let backup: Backup = serde_json::from_slice(&raw).map_err(|e| {
            VaultError::BackupFailed(format!("{} is not a backup: {e}", path.display()))
        })?;
        if !validate_backup(&backup) {
            #[cfg(feature = "metrics")]
            counter!(backup_metrics::INVALID_TOTAL).increment(1);
            return Err(VaultError::BackupFailed(format!(
                "{} failed checksum validation",
                path.display()
            )));
        }
        Ok(backup)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::store_memory::MemoryStore,
        serde_json::json,
    };

    fn setup(retention: usize) -> (Arc<dyn KeyValueStore>, BackupStore) {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        (store.clone(), BackupStore::new(store, retention))
    }

    fn records() -> Vec<Value> {
        vec![
            json!({"id": "a", "person1": "Ann"}),
            json!({"id": "b", "person1": "Bo", "services": [{"notes": "x"}]}),
        ]
    }

    #[tokio::test]
    async fn created_backup_validates() {
        let (_, backups) = setup(5);
        let backup = backups.create_backup(&records(), BackupKind::Manual).await.unwrap();
        assert_eq!(backup.count, 2);
        assert!(validate_backup(&backup));
        assert_eq!(backups.get(&backup.id).await.unwrap(), Some(backup));
    }

    #[test]
    fn tampered_backup_fails_validation() {
        let records = records();
        let mut backup = Backup {
            id: backup_key(1),
            timestamp_ms: 1,
            kind: BackupKind::Auto,
            count: records.len(),
            checksum: records_checksum(&records).unwrap(),
            records,
        };
        assert!(validate_backup(&backup));

        backup.records[0]["person1"] = json!("Eve");
        assert!(!validate_backup(&backup));

        backup.records = Vec::new();
        backup.checksum = records_checksum(&[]).unwrap();
        assert!(!validate_backup(&backup), "count must match");
    }

    #[tokio::test]
    async fn prunes_oldest_beyond_retention() {
        let (_, backups) = setup(3);
        let mut ids = Vec::new();
        for i in 0..5 {
            let b = backups
                .create_backup(&[json!({"id": i})], BackupKind::Auto)
                .await
                .unwrap();
            ids.push(b.id);
        }

        let kept: Vec<String> = backups.list().await.unwrap().into_iter().map(|b| b.id).collect();
        assert_eq!(kept, vec![ids[4].clone(), ids[3].clone(), ids[2].clone()]);
        assert_eq!(backups.latest().await.unwrap().unwrap().id, ids[4]);
    }

    #[tokio::test]
    async fn ids_increase_within_one_millisecond() {
        let (_, backups) = setup(10);
        let a = backups.create_backup(&[], BackupKind::Auto).await.unwrap();
        let b = backups.create_backup(&[], BackupKind::Auto).await.unwrap();
        assert!(b.id > a.id);
        assert!(b.timestamp_ms > a.timestamp_ms);
    }

    #[tokio::test]
    async fn create_fails_when_storage_is_full() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::with_quota(64));
        let backups = BackupStore::new(store, 5);
        let err = backups
            .create_backup(&records(), BackupKind::PreMigration)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::QuotaExceeded(_)));
    }

    #[tokio::test]
    async fn restore_writes_records_and_rearms_migration() {
        let (store, backups) = setup(5);
        store
            .put(StoreName::Meta, keys::MIGRATION_STATE, &json!({"completed": true}))
            .await
            .unwrap();
        let backup = backups.create_backup(&records(), BackupKind::Manual).await.unwrap();

        assert_eq!(backups.restore(&backup).await.unwrap(), 2);
        assert_eq!(
            store.get(StoreName::Records, "b").await.unwrap(),
            Some(records()[1].clone())
        );
        assert!(store.get(StoreName::Meta, keys::MIGRATION_STATE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn restore_refuses_invalid_backup() {
        let (store, backups) = setup(5);
        let mut backup = backups.create_backup(&records(), BackupKind::Manual).await.unwrap();
        backup.checksum = "0".repeat(64);

        assert!(matches!(
            backups.restore(&backup).await,
            Err(VaultError::BackupFailed(_))
        ));
        assert!(store.get_all(StoreName::Records).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn export_and_restore_from_file() {
        let (_, backups) = setup(5);
        let backup = backups.create_backup(&records(), BackupKind::Manual).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.json");

        backups.export_to_file(&backup, &path).await.unwrap();
        assert_eq!(backups.restore_from_file(&path).await.unwrap(), backup);

        let mut raw: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        raw["records"][0]["id"] = json!("zzz");
        std::fs::write(&path, serde_json::to_vec(&raw).unwrap()).unwrap();
        assert!(matches!(
            backups.restore_from_file(&path).await,
            Err(VaultError::BackupFailed(_))
        ));
    }

    #[test]
    fn kind_parses_and_serializes_kebab_case() {
        assert_eq!("pre-migration".parse::<BackupKind>().unwrap(), BackupKind::PreMigration);
        assert_eq!(serde_json::to_value(BackupKind::PreMigration).unwrap(), json!("pre-migration"));
        assert!("weekly".parse::<BackupKind>().is_err());
    }
}
