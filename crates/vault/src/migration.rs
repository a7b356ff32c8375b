//! One-time, resumable migration of legacy plaintext records to encrypted
//! storage.
//!
//! Every run takes a pre-migration backup first and refuses to touch any
//! record if that fails. Records are then migrated strictly one at a time;
//! each is encrypted, decrypted again and compared before the encrypted
//! form replaces the plaintext.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use {
    recordseal_config::MigrationConfig,
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

#[cfg(feature = "metrics")]
use recordseal_metrics::{counter, histogram, migration as migration_metrics};

use crate::{
    aes256gcm::Aes256GcmCipher,
    backup::{BackupKind, BackupStore},
    error::{Result, VaultError},
    master_key::{MasterKey, MasterKeyManager},
    record::{DecryptOptions, RecordCipher, is_encrypted, record_id},
    store::{KeyValueStore, StoreName, WriteBatch, keys},
    traits::Cipher,
};

/// Lifecycle of the migration on this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    NotStarted,
    Running,
    Completed,
}

/// What a single [`MigrationEngine::run_if_needed`] call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The run finished and the completion flag is now set.
    Completed,
    /// The run finished but transient failures left records to retry, so
    /// the flag was not set.
    Incomplete,
    /// Nothing to do: a previous run completed.
    AlreadyCompleted,
    /// Another run is in progress; nothing was done.
    AlreadyRunning,
}

/// Persisted under [`keys::MIGRATION_STATE`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationState {
    pub completed: bool,
    pub completed_at_ms: u64,
    #[serde(default)]
    pub migrated: usize,
    #[serde(default)]
    pub failed: usize,
}

/// A record that could not be migrated. It stays in plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationItemError {
    pub record_id: Option<String>,
    pub attempts: u32,
    pub message: String,
    /// Whether a future run may succeed.
    pub transient: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub status: RunStatus,
    pub migrated: usize,
    pub errors: usize,
    pub total: usize,
    pub error_details: Vec<MigrationItemError>,
}

impl MigrationReport {
    fn empty(status: RunStatus) -> Self {
        Self {
            status,
            migrated: 0,
            errors: 0,
            total: 0,
            error_details: Vec::new(),
        }
    }
}

/// Progress notification, emitted every `progress_every` records and once
/// at the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationProgress {
    pub processed: usize,
    pub total: usize,
    pub migrated: usize,
    pub errors: usize,
}

pub type ProgressCallback = Arc<dyn Fn(&MigrationProgress) + Send + Sync>;

/// Result of [`retry_with_backoff`].
#[derive(Debug)]
pub struct RetryOutcome {
    pub success: bool,
    pub attempts: u32,
    pub error: Option<VaultError>,
}

/// Run `op` up to `max_attempts` times, sleeping `attempt * base_delay`
/// after each failed attempt except the last.
pub async fn retry_with_backoff<F, Fut>(max_attempts: u32, base_delay: Duration, mut op: F) -> RetryOutcome
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let max_attempts = max_attempts.max(1);
    let mut last_error = None;
    for attempt in 1..=max_attempts {
        match op(attempt).await {
            Ok(()) => {
                return RetryOutcome {
                    success: true,
                    attempts: attempt,
                    error: None,
                };
            },
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(attempt, max_attempts, error = %e, "attempt failed");
                if attempt < max_attempts {
                    #[cfg(feature = "metrics")]
                    counter!(migration_metrics::RETRIES_TOTAL).increment(1);
                    tokio::time::sleep(base_delay * attempt).await;
                }
                last_error = Some(e);
            },
        }
    }
    RetryOutcome {
        success: false,
        attempts: max_attempts,
        error: last_error,
    }
}

/// Clears the running flag when a run ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub struct MigrationEngine<C: Cipher = Aes256GcmCipher> {
    store: Arc<dyn KeyValueStore>,
    keys: Arc<MasterKeyManager<C>>,
    cipher: Arc<RecordCipher<C>>,
    backups: Arc<BackupStore>,
    config: MigrationConfig,
    running: AtomicBool,
    progress: Option<ProgressCallback>,
}

impl<C: Cipher> MigrationEngine<C> {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        keys: Arc<MasterKeyManager<C>>,
        cipher: Arc<RecordCipher<C>>,
        backups: Arc<BackupStore>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            store,
            keys,
            cipher,
            backups,
            config,
            running: AtomicBool::new(false),
            progress: None,
        }
    }

    #[must_use]
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub async fn status(&self) -> Result<MigrationStatus> {
        if self.running.load(Ordering::Acquire) {
            return Ok(MigrationStatus::Running);
        }
        Ok(match self.load_state().await? {
            Some(state) if state.completed => MigrationStatus::Completed,
            _ => MigrationStatus::NotStarted,
        })
    }

    pub async fn load_state(&self) -> Result<Option<MigrationState>> {
        self.store
            .get(StoreName::Meta, keys::MIGRATION_STATE)
            .await?
            .map(serde_json::from_value)
            .transpose()
            .map_err(Into::into)
    }

    /// Migrate every legacy record, unless a previous run completed.
    pub async fn run_if_needed(&self) -> Result<MigrationReport> {
        if self.is_completed().await? {
            return Ok(MigrationReport::empty(RunStatus::AlreadyCompleted));
        }
        let Some(_guard) = RunGuard::acquire(&self.running) else {
            return Ok(MigrationReport::empty(RunStatus::AlreadyRunning));
        };

        let key = self.keys.get_master_key().await?;
        let legacy: Vec<(String, Value)> = self
            .store
            .get_all(StoreName::Records)
            .await?
            .into_iter()
            .filter(|(_, record)| !is_encrypted(record))
            .collect();

        if legacy.is_empty() {
            self.mark_completed(0, 0).await?;
            #[cfg(feature = "tracing")]
            tracing::info!("no legacy records, migration marked complete");
            return Ok(MigrationReport::empty(RunStatus::Completed));
        }

        self.migrate_locked(legacy, &key).await
    }

    /// Migrate exactly `entries`, backing them up first. Each entry is the
    /// store key the plaintext currently lives under and the record itself.
    pub async fn migrate(&self, entries: Vec<(String, Value)>) -> Result<MigrationReport> {
        let Some(_guard) = RunGuard::acquire(&self.running) else {
            return Ok(MigrationReport::empty(RunStatus::AlreadyRunning));
        };
        let key = self.keys.get_master_key().await?;
        self.migrate_locked(entries, &key).await
    }

    async fn migrate_locked(&self, entries: Vec<(String, Value)>, key: &MasterKey) -> Result<MigrationReport> {
        #[cfg(feature = "metrics")]
        let started = std::time::Instant::now();
        let total = entries.len();
        let records: Vec<Value> = entries.iter().map(|(_, record)| record.clone()).collect();

        #[cfg(feature = "tracing")]
        tracing::info!(total, "starting record migration");

        if let Err(e) = self
            .backups
            .create_backup(&records, BackupKind::PreMigration)
            .await
        {
            #[cfg(feature = "tracing")]
            tracing::error!(error = %e, "pre-migration backup failed, migration aborted");
            return Err(match e {
                VaultError::BackupFailed(_) => e,
                other => VaultError::BackupFailed(other.to_string()),
            });
        }

        let every = self.config.progress_every.max(1);
        let mut report = MigrationReport {
            status: RunStatus::Completed,
            migrated: 0,
            errors: 0,
            total,
            error_details: Vec::new(),
        };

        for (index, (store_key, record)) in entries.iter().enumerate() {
            let outcome = self.migrate_one_with_retry(store_key, record, key).await;
            if outcome.success {
                report.migrated += 1;
                #[cfg(feature = "metrics")]
                counter!(migration_metrics::RECORDS_MIGRATED_TOTAL).increment(1);
            } else {
                let record_id = record_id(record).ok();
                let (message, transient) = outcome
                    .error
                    .map(|e| (e.to_string(), e.is_transient()))
                    .unwrap_or_else(|| ("unknown failure".into(), false));
                #[cfg(feature = "metrics")]
                counter!(migration_metrics::RECORDS_FAILED_TOTAL).increment(1);
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    record_id = record_id.as_deref().unwrap_or("?"),
                    attempts = outcome.attempts,
                    transient,
                    %message,
                    "record migration failed"
                );
                report.errors += 1;
                report.error_details.push(MigrationItemError {
                    record_id,
                    attempts: outcome.attempts,
                    message,
                    transient,
                });
            }

            let processed = index + 1;
            if processed % every == 0 || processed == total {
                self.notify(&MigrationProgress {
                    processed,
                    total,
                    migrated: report.migrated,
                    errors: report.errors,
                });
            }
        }

        if report.error_details.iter().any(|e| e.transient) {
            report.status = RunStatus::Incomplete;
        } else {
            self.mark_completed(report.migrated, report.errors).await?;
        }

        #[cfg(feature = "metrics")]
        histogram!(migration_metrics::RUN_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        #[cfg(feature = "tracing")]
        tracing::info!(
            migrated = report.migrated,
            errors = report.errors,
            total,
            status = ?report.status,
            "record migration finished"
        );

        Ok(report)
    }

    /// [`MigrationEngine::migrate_one`] under [`retry_with_backoff`] with the
    /// configured attempts and base delay.
    pub async fn migrate_one_with_retry(
        &self,
        store_key: &str,
        record: &Value,
        key: &MasterKey,
    ) -> RetryOutcome {
        retry_with_backoff(
            self.config.max_attempts,
            Duration::from_millis(self.config.base_delay_ms),
            |_| self.migrate_one(store_key, record, key),
        )
        .await
    }

    /// Encrypt, decrypt again, compare the sensitive fields, and only then
    /// replace the plaintext stored under `store_key`.
    ///
    /// The encrypted form is always written under the record's `id`. A
    /// plaintext copy under any other key is removed in the same batch.
    pub async fn migrate_one(&self, store_key: &str, record: &Value, key: &MasterKey) -> Result<()> {
        let id = record_id(record)?;
        let encrypted = self.cipher.encrypt(record, key)?;
        let decrypted = self
            .cipher
            .decrypt(&encrypted, key, DecryptOptions::default())?;

        let (_, original) = self.cipher.separate(record)?;
        let (_, round_tripped) = self.cipher.separate(&decrypted.record)?;
        if serde_json::to_vec(&original)? != serde_json::to_vec(&round_tripped)? {
            return Err(VaultError::CipherError(format!(
                "verification failed for record {id}, plaintext kept"
            )));
        }

        let value = encrypted.to_value()?;
        if store_key == id {
            return self.store.put(StoreName::Records, &id, &value).await;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(record_id = %id, store_key, "moving migrated record to its id");
        let mut batch = WriteBatch::new();
        batch
            .put(StoreName::Records, id, value)
            .delete(StoreName::Records, store_key);
        self.store.apply(batch).await
    }

    async fn is_completed(&self) -> Result<bool> {
        Ok(self.load_state().await?.is_some_and(|s| s.completed))
    }

    async fn mark_completed(&self, migrated: usize, failed: usize) -> Result<()> {
        let state = MigrationState {
            completed: true,
            completed_at_ms: now_ms(),
            migrated,
            failed,
        };
        self.store
            .put(
                StoreName::Meta,
                keys::MIGRATION_STATE,
                &serde_json::to_value(&state)?,
            )
            .await
    }

    fn notify(&self, progress: &MigrationProgress) {
        #[cfg(feature = "tracing")]
        tracing::info!(
            processed = progress.processed,
            total = progress.total,
            "migration progress"
        );
        if let Some(callback) = &self.progress {
            callback(progress);
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            device::{DeviceKeyDeriver, tests::fingerprint},
            master_key::tests::manager_for,
            store_memory::MemoryStore,
            traits::Sealed,
        },
        async_trait::async_trait,
        recordseal_config::FieldsConfig,
        serde_json::json,
        std::sync::{
            Mutex,
            atomic::AtomicUsize,
        },
    };

    /// Delegates to [`MemoryStore`] but fails the first `fail_puts`
    /// record writes, and optionally every backup write.
    struct FlakyStore {
        inner: MemoryStore,
        fail_puts: AtomicUsize,
        fail_backups: bool,
    }

    impl FlakyStore {
        fn new(fail_puts: usize, fail_backups: bool) -> Self {
            Self {
                inner: MemoryStore::new(),
                fail_puts: AtomicUsize::new(fail_puts),
                fail_backups,
            }
        }
    }

    #[async_trait]
    impl KeyValueStore for FlakyStore {
        async fn ping(&self) -> Result<()> {
            self.inner.ping().await
        }

        async fn get(&self, store: StoreName, key: &str) -> Result<Option<Value>> {
            self.inner.get(store, key).await
        }

        async fn put(&self, store: StoreName, key: &str, value: &Value) -> Result<()> {
            if store == StoreName::Backups && self.fail_backups {
                return Err(VaultError::QuotaExceeded("no room for backup".into()));
            }
            if store == StoreName::Records
                && self
                    .fail_puts
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                    .is_ok()
            {
                return Err(VaultError::store("write interrupted"));
            }
            self.inner.put(store, key, value).await
        }

        async fn delete(&self, store: StoreName, key: &str) -> Result<bool> {
            self.inner.delete(store, key).await
        }

        async fn get_all(&self, store: StoreName) -> Result<Vec<(String, Value)>> {
            self.inner.get_all(store).await
        }

        async fn apply(&self, batch: WriteBatch) -> Result<()> {
            self.inner.apply(batch).await
        }
    }

    fn engine(store: Arc<dyn KeyValueStore>, max_attempts: u32) -> MigrationEngine {
        let keys = Arc::new(manager_for(store.clone(), fingerprint("app")));
        let cipher = Arc::new(RecordCipher::new(&FieldsConfig::default()));
        let backups = Arc::new(BackupStore::new(store.clone(), 5));
        MigrationEngine::new(store, keys, cipher, backups, MigrationConfig {
            max_attempts,
            base_delay_ms: 100,
            progress_every: 2,
        })
    }

    /// Seed through `apply`, which the flaky store never fails.
    async fn seed(store: &Arc<dyn KeyValueStore>, n: usize) {
        let mut batch = WriteBatch::new();
        for i in 0..n {
            let id = format!("r{i}");
            batch.put(StoreName::Records, id.clone(), json!({
                "id": id,
                "person1": format!("Person {i}"),
                "services": [{"notes": "critical", "kind": "care"}]
            }));
        }
        store.apply(batch).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_on_third_attempt() {
        let calls = AtomicUsize::new(0);
        let started = tokio::time::Instant::now();
        let outcome = retry_with_backoff(3, Duration::from_millis(100), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(VaultError::store("busy"))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(outcome.success);
        assert_eq!(outcome.attempts, 3);
        assert!(outcome.error.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1 * 100ms + 2 * 100ms
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(300) && waited < Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_stops_at_max_attempts() {
        let calls = AtomicUsize::new(0);
        let outcome = retry_with_backoff(2, Duration::from_millis(10), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(VaultError::DecryptionAuth) }
        })
        .await;

        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 2);
        assert!(matches!(outcome.error, Some(VaultError::DecryptionAuth)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn migrates_legacy_records_and_is_idempotent() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        seed(&store, 3).await;
        let engine = engine(store.clone(), 3);
        assert_eq!(engine.status().await.unwrap(), MigrationStatus::NotStarted);

        let report = engine.run_if_needed().await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!((report.migrated, report.errors, report.total), (3, 0, 3));
        assert_eq!(engine.status().await.unwrap(), MigrationStatus::Completed);

        for (_, record) in store.get_all(StoreName::Records).await.unwrap() {
            assert!(is_encrypted(&record));
            assert!(!record.to_string().contains("critical"));
        }
        let backups = store.get_all(StoreName::Backups).await.unwrap();
        assert_eq!(backups.len(), 1);

        let before = store.get_all(StoreName::Records).await.unwrap();
        let second = engine.run_if_needed().await.unwrap();
        assert_eq!(second, MigrationReport::empty(RunStatus::AlreadyCompleted));
        assert_eq!(store.get_all(StoreName::Records).await.unwrap(), before);
        assert_eq!(store.get_all(StoreName::Backups).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn no_legacy_records_marks_complete_without_backup() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let engine = engine(store.clone(), 3);

        let report = engine.run_if_needed().await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.total, 0);
        assert!(store.get_all(StoreName::Backups).await.unwrap().is_empty());
        assert!(engine.load_state().await.unwrap().unwrap().completed);
    }

    #[tokio::test]
    async fn backup_failure_aborts_before_touching_records() {
        let store: Arc<dyn KeyValueStore> = Arc::new(FlakyStore::new(0, true));
        seed(&store, 2).await;
        let engine = engine(store.clone(), 3);

        let err = engine.run_if_needed().await.unwrap_err();
        assert!(matches!(err, VaultError::BackupFailed(_)));
        for (_, record) in store.get_all(StoreName::Records).await.unwrap() {
            assert!(!is_encrypted(&record));
        }
        assert_eq!(engine.status().await.unwrap(), MigrationStatus::NotStarted);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_write_failures_are_retried() {
        let store: Arc<dyn KeyValueStore> = Arc::new(FlakyStore::new(2, false));
        seed(&store, 1).await;
        let engine = engine(store.clone(), 3);

        let report = engine.run_if_needed().await.unwrap();
        assert_eq!(report.migrated, 1);
        assert_eq!(report.status, RunStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_transient_failures_leave_migration_open() {
        let store: Arc<dyn KeyValueStore> = Arc::new(FlakyStore::new(usize::MAX, false));
        seed(&store, 1).await;
        let engine = engine(store, 2);

        let report = engine.run_if_needed().await.unwrap();
        assert_eq!(report.status, RunStatus::Incomplete);
        assert_eq!(report.errors, 1);
        let detail = &report.error_details[0];
        assert_eq!(detail.record_id.as_deref(), Some("r0"));
        assert_eq!(detail.attempts, 2);
        assert!(detail.transient);
        assert_eq!(engine.status().await.unwrap(), MigrationStatus::NotStarted);
    }

    #[tokio::test]
    async fn permanent_failures_are_reported_and_run_completes() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        seed(&store, 2).await;
        store
            .put(StoreName::Records, "bad", &json!({"id": "bad", "checksum": "reserved"}))
            .await
            .unwrap();
        let engine = engine(store.clone(), 1);

        let report = engine.run_if_needed().await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!((report.migrated, report.errors, report.total), (2, 1, 3));
        assert!(!report.error_details[0].transient);
        assert!(!is_encrypted(&store.get(StoreName::Records, "bad").await.unwrap().unwrap()));
    }

    #[tokio::test]
    async fn progress_is_reported_at_cadence() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        seed(&store, 5).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let engine = engine(store, 3).with_progress(Arc::new(move |p: &MigrationProgress| {
            sink.lock().unwrap().push(p.processed);
        }));

        engine.run_if_needed().await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![2, 4, 5]);
    }

    #[tokio::test]
    async fn concurrent_run_reports_already_running() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let engine = engine(store, 3);
        let _guard = RunGuard::acquire(&engine.running).unwrap();

        let report = engine.run_if_needed().await.unwrap();
        assert_eq!(report.status, RunStatus::AlreadyRunning);
        assert_eq!(engine.status().await.unwrap(), MigrationStatus::Running);
    }

    /// AES-GCM, except record plaintexts come back with every `J` turned
    /// into `K`.
    struct CorruptingCipher;

    impl Cipher for CorruptingCipher {
        fn version_tag(&self) -> u8 {
            Aes256GcmCipher.version_tag()
        }

        fn algorithm(&self) -> &'static str {
            Aes256GcmCipher.algorithm()
        }

        fn nonce_len(&self) -> usize {
            Aes256GcmCipher.nonce_len()
        }

        fn encrypt(&self, key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Sealed> {
            Aes256GcmCipher.encrypt(key, plaintext, aad)
        }

        fn decrypt(&self, key: &[u8; 32], nonce: &[u8], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
            let mut plaintext = Aes256GcmCipher.decrypt(key, nonce, ciphertext, aad)?;
            if aad.starts_with(b"record:") {
                for b in plaintext.iter_mut().filter(|b| **b == b'J') {
                    *b = b'K';
                }
            }
            Ok(plaintext)
        }
    }

    #[tokio::test]
    async fn mismatched_round_trip_keeps_plaintext() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let keys = Arc::new(MasterKeyManager::with_cipher(
            store.clone(),
            DeviceKeyDeriver::for_tests(store.clone(), fingerprint("app")),
            CorruptingCipher,
            Duration::from_secs(300),
        ));
        let cipher = Arc::new(RecordCipher::with_cipher(CorruptingCipher, &FieldsConfig::default()));
        let backups = Arc::new(BackupStore::new(store.clone(), 5));
        let engine = MigrationEngine::new(store.clone(), keys, cipher, backups, MigrationConfig {
            max_attempts: 1,
            base_delay_ms: 0,
            progress_every: 1,
        });
        let original = json!({"id": "r1", "person1": "José"});
        store.put(StoreName::Records, "r1", &original).await.unwrap();
        let key = engine.keys.get_master_key().await.unwrap();

        let err = engine.migrate_one("r1", &original, &key).await.unwrap_err();
        assert!(err.to_string().contains("verification failed"), "{err}");
        assert_eq!(store.get(StoreName::Records, "r1").await.unwrap(), Some(original));

        let report = engine.run_if_needed().await.unwrap();
        assert_eq!((report.migrated, report.errors), (0, 1));
        assert!(!report.error_details[0].transient);
        let stored = store.get(StoreName::Records, "r1").await.unwrap().unwrap();
        assert!(!is_encrypted(&stored));
        assert!(stored.to_string().contains("José"));
    }

    #[tokio::test]
    async fn legacy_record_under_foreign_key_is_moved_to_its_id() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        store
            .put(StoreName::Records, "legacy-key", &json!({"id": "r1", "person1": "José"}))
            .await
            .unwrap();
        let engine = engine(store.clone(), 3);

        let report = engine.run_if_needed().await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.migrated, 1);

        let records = store.get_all(StoreName::Records).await.unwrap();
        assert_eq!(records.len(), 1);
        let (stored_key, stored) = &records[0];
        assert_eq!(stored_key, "r1");
        assert!(is_encrypted(stored));
        assert!(!stored.to_string().contains("José"));
    }

    #[tokio::test]
    async fn float_fields_migrate() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let original = json!({"id": "r", "notes": 0.11475424859373685});
        store.put(StoreName::Records, "r", &original).await.unwrap();
        let engine = engine(store.clone(), 1);

        let report = engine.run_if_needed().await.unwrap();
        assert_eq!((report.migrated, report.errors), (1, 0));
        let key = engine.keys.get_master_key().await.unwrap();
        let stored = store.get(StoreName::Records, "r").await.unwrap().unwrap();
        let opened = engine
            .cipher
            .decrypt_value(&stored, &key, DecryptOptions::default())
            .unwrap();
        assert_eq!(opened.record, original);
    }

    #[tokio::test]
    async fn migrated_record_decrypts_to_original() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let engine = engine(store.clone(), 3);
        let original = json!({"id": "r1", "person1": "José Núñez", "services": [{"notes": "critical"}]});
        let key = engine.keys.get_master_key().await.unwrap();

        engine.migrate_one("r1", &original, &key).await.unwrap();
        let stored = store.get(StoreName::Records, "r1").await.unwrap().unwrap();
        let opened = engine
            .cipher
            .decrypt_value(&stored, &key, DecryptOptions::default())
            .unwrap();
        assert_eq!(opened.record, original);
    }
}
