//! Application-facing facade tying keys, records, backups and migration
//! together over one store.

use std::{path::Path, sync::Arc, time::Duration};

use {
    recordseal_config::RecordsealConfig,
    serde::Serialize,
    serde_json::Value,
};

use crate::{
    backup::{Backup, BackupKind, BackupStore},
    device::{DeviceFingerprint, DeviceKeyDeriver},
    error::{Result, VaultError},
    master_key::{InitOutcome, KeyDiagnostics, MasterKey, MasterKeyManager},
    migration::{MigrationEngine, MigrationReport, MigrationStatus, ProgressCallback},
    record::{DecryptOptions, EncryptedRecord, IntegrityWarning, RecordCipher, is_encrypted},
    recovery::{self, RecoveryPhrase},
    store::{KeyValueStore, StoreName},
    store_sqlite::SqliteStore,
};

/// A record as handed back to the application.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadedRecord {
    pub record: Value,
    /// False for legacy plaintext records still awaiting migration.
    pub encrypted: bool,
    pub warnings: Vec<IntegrityWarning>,
}

/// Combined report for support tooling.
#[derive(Debug, Clone, Serialize)]
pub struct VaultDiagnostics {
    pub keys: KeyDiagnostics,
    pub migration: Option<MigrationStatus>,
    pub records_total: usize,
    pub records_encrypted: usize,
    pub backups: usize,
    pub problems: Vec<String>,
}

pub struct RecordVault {
    store: Arc<dyn KeyValueStore>,
    keys: Arc<MasterKeyManager>,
    cipher: Arc<RecordCipher>,
    backups: Arc<BackupStore>,
    migration: MigrationEngine,
}

impl RecordVault {
    /// Open the configured SQLite database, creating it if needed.
    pub async fn open(config: &RecordsealConfig) -> Result<Self> {
        let path = recordseal_config::default_database_path(config);
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let store = SqliteStore::open(&url).await?;

        #[cfg(feature = "tracing")]
        tracing::debug!(path = %path.display(), "opened record store");

        Self::new(Arc::new(store), config)
    }

    /// Open the configured database read-only for inspection. Returns
    /// `None` when no database exists yet; nothing is created.
    pub async fn open_read_only(config: &RecordsealConfig) -> Result<Option<Self>> {
        let path = recordseal_config::default_database_path(config);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        let url = format!("sqlite:{}?mode=ro", path.display());
        let store = SqliteStore::open_existing(&url).await?;

        #[cfg(feature = "tracing")]
        tracing::debug!(path = %path.display(), "opened record store read-only");

        Self::new(Arc::new(store), config).map(Some)
    }

    /// Build over any store, fingerprinting the current device.
    pub fn new(store: Arc<dyn KeyValueStore>, config: &RecordsealConfig) -> Result<Self> {
        let fingerprint = DeviceFingerprint::detect(config.keys.client_id.clone());
        let deriver = DeviceKeyDeriver::new(store.clone(), fingerprint, config.keys.kdf_iterations)?;
        Ok(Self::from_parts(store, deriver, config))
    }

    pub fn from_parts(
        store: Arc<dyn KeyValueStore>,
        deriver: DeviceKeyDeriver,
        config: &RecordsealConfig,
    ) -> Self {
        let keys = Arc::new(MasterKeyManager::new(
            store.clone(),
            deriver,
            Duration::from_secs(config.keys.cache_ttl_secs),
        ));
        let cipher = Arc::new(RecordCipher::new(&config.fields));
        let backups = Arc::new(BackupStore::new(store.clone(), config.backup.retention));
        let migration = MigrationEngine::new(
            store.clone(),
            keys.clone(),
            cipher.clone(),
            backups.clone(),
            config.migration.clone(),
        );
        Self {
            store,
            keys,
            cipher,
            backups,
            migration,
        }
    }

    #[must_use]
    pub fn with_migration_progress(mut self, callback: ProgressCallback) -> Self {
        self.migration = self.migration.with_progress(callback);
        self
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn cipher(&self) -> &RecordCipher {
        &self.cipher
    }

    // ── Keys ────────────────────────────────────────────────────────────────

    /// Probe capabilities and make sure a usable master key exists.
    pub async fn ensure_key_system_ready(&self) -> Result<InitOutcome> {
        self.keys.ensure_supported().await?;
        self.keys.initialize_key_system().await
    }

    pub async fn master_key(&self) -> Result<MasterKey> {
        self.keys.get_master_key().await
    }

    pub async fn reset_key_system(&self, confirmed: bool) -> Result<()> {
        self.keys.reset_key_system(confirmed).await
    }

    /// Read-only health report. Never fails and never writes.
    pub async fn diagnose(&self) -> VaultDiagnostics {
        let mut report = VaultDiagnostics {
            keys: self.keys.diagnose().await,
            migration: None,
            records_total: 0,
            records_encrypted: 0,
            backups: 0,
            problems: Vec::new(),
        };

        match self.migration.status().await {
            Ok(status) => report.migration = Some(status),
            Err(e) => report.problems.push(format!("migration state: {e}")),
        }
        match self.store.get_all(StoreName::Records).await {
            Ok(records) => {
                report.records_total = records.len();
                report.records_encrypted = records.iter().filter(|(_, r)| is_encrypted(r)).count();
            },
            Err(e) => report.problems.push(format!("records: {e}")),
        }
        match self.store.get_all(StoreName::Backups).await {
            Ok(backups) => report.backups = backups.len(),
            Err(e) => report.problems.push(format!("backups: {e}")),
        }
        report
    }

    // ── Records ─────────────────────────────────────────────────────────────

    /// Encrypt and persist `record`. Fails closed: nothing is written
    /// unless encryption succeeded.
    pub async fn save_record(&self, record: &Value) -> Result<EncryptedRecord> {
        let key = self.keys.get_master_key().await?;
        let encrypted = self.cipher.encrypt(record, &key)?;
        let id = encrypted.id()?;
        self.store
            .put(StoreName::Records, &id, &encrypted.to_value()?)
            .await?;

        #[cfg(feature = "tracing")]
        tracing::debug!(record_id = %id, "record saved");
        Ok(encrypted)
    }

    pub async fn load_record(&self, id: &str) -> Result<Option<LoadedRecord>> {
        match self.store.get(StoreName::Records, id).await? {
            Some(stored) => {
                let key = if is_encrypted(&stored) {
                    Some(self.keys.get_master_key().await?)
                } else {
                    None
                };
                self.present(stored, key.as_ref()).map(Some)
            },
            None => Ok(None),
        }
    }

    /// Every record, decrypted. Legacy records are returned as stored.
    /// Any record failing authentication fails the whole call.
    pub async fn load_all_records(&self) -> Result<Vec<LoadedRecord>> {
        let stored = self.store.get_all(StoreName::Records).await?;
        let key = if stored.iter().any(|(_, r)| is_encrypted(r)) {
            Some(self.keys.get_master_key().await?)
        } else {
            None
        };
        stored
            .into_iter()
            .map(|(_, record)| self.present(record, key.as_ref()))
            .collect()
    }

    pub async fn delete_record(&self, id: &str) -> Result<bool> {
        self.store.delete(StoreName::Records, id).await
    }

    fn present(&self, stored: Value, key: Option<&MasterKey>) -> Result<LoadedRecord> {
        if !is_encrypted(&stored) {
            return Ok(LoadedRecord {
                record: stored,
                encrypted: false,
                warnings: Vec::new(),
            });
        }
        let key = key.ok_or(VaultError::NotInitialized)?;
        let decrypted = self
            .cipher
            .decrypt_value(&stored, key, DecryptOptions::default())?;
        Ok(LoadedRecord {
            record: decrypted.record,
            encrypted: true,
            warnings: decrypted.warnings,
        })
    }

    // ── Migration ───────────────────────────────────────────────────────────

    pub async fn run_migration_if_needed(&self) -> Result<MigrationReport> {
        self.migration.run_if_needed().await
    }

    pub async fn migration_status(&self) -> Result<MigrationStatus> {
        self.migration.status().await
    }

    // ── Backups ─────────────────────────────────────────────────────────────

    /// Snapshot every stored record in its stored (ciphertext) form.
    pub async fn create_backup(&self, kind: BackupKind) -> Result<Backup> {
        let records: Vec<Value> = self
            .store
            .get_all(StoreName::Records)
            .await?
            .into_iter()
            .map(|(_, record)| record)
            .collect();
        self.backups.create_backup(&records, kind).await
    }

    pub async fn list_backups(&self) -> Result<Vec<Backup>> {
        self.backups.list().await
    }

    pub async fn get_backup(&self, id: &str) -> Result<Option<Backup>> {
        self.backups.get(id).await
    }

    pub async fn restore_backup(&self, backup: &Backup) -> Result<usize> {
        self.backups.restore(backup).await
    }

    /// Export backup `id`, or the latest backup when `id` is `None`.
    pub async fn export_backup_to_file(&self, id: Option<&str>, path: &Path) -> Result<Backup> {
        let backup = match id {
            Some(id) => self.backups.get(id).await?,
            None => self.backups.latest().await?,
        }
        .ok_or_else(|| VaultError::BackupFailed("no such backup".into()))?;
        self.backups.export_to_file(&backup, path).await?;
        Ok(backup)
    }

    /// Validate a backup file and restore its records.
    pub async fn restore_backup_from_file(&self, path: &Path) -> Result<usize> {
        let backup = self.backups.restore_from_file(path).await?;
        self.backups.restore(&backup).await
    }

    // ── Recovery ────────────────────────────────────────────────────────────

    pub async fn export_recovery_phrase(&self) -> Result<RecoveryPhrase> {
        if !recovery::RECOVERY_PHRASE_ENABLED {
            return Err(VaultError::NotSupported("recovery phrases are disabled"));
        }
        let key = self.keys.get_master_key().await?;
        recovery::export_recovery_phrase(&key)
    }

    pub fn import_from_recovery_phrase(&self, phrase: &str) -> Result<()> {
        recovery::import_from_recovery_phrase(phrase).map(|_| ())
    }
}
