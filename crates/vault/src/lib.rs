//! Transparent at-rest encryption for application records.
//!
//! A device-bound wrapping key (PBKDF2 over a persisted salt and a stable
//! device fingerprint) protects a random AES-256-GCM master key. Records
//! have their sensitive fields sealed individually; legacy plaintext
//! records are migrated once, behind a verified backup.

pub mod aes256gcm;
pub mod backup;
pub mod device;
pub mod error;
pub mod kdf;
pub mod key_cache;
pub mod key_wrap;
pub mod master_key;
pub mod migration;
pub mod record;
pub mod recovery;
pub mod store;
pub mod store_memory;
pub mod store_sqlite;
pub mod traits;
pub mod vault;

pub use {
    aes256gcm::Aes256GcmCipher,
    backup::{Backup, BackupKind, BackupStore, validate_backup},
    device::{DeviceFingerprint, DeviceKeyDeriver, KeyDerivationStrategy, WrappingKey},
    error::{Result, VaultError},
    key_cache::KeyCache,
    master_key::{InitOutcome, KeyDiagnostics, MasterKey, MasterKeyManager, WrappedMasterKey},
    migration::{
        MigrationEngine, MigrationItemError, MigrationProgress, MigrationReport, MigrationStatus,
        RetryOutcome, RunStatus, retry_with_backoff,
    },
    record::{
        DecryptOptions, Decrypted, EncryptedRecord, Envelope, IntegrityWarning, RecordCipher,
        SensitivePayload, is_encrypted,
    },
    recovery::{RECOVERY_PHRASE_ENABLED, RecoveryPhrase},
    store::{KeyValueStore, StoreName, WriteBatch, WriteOp},
    store_memory::MemoryStore,
    store_sqlite::SqliteStore,
    traits::Cipher,
    vault::{LoadedRecord, RecordVault, VaultDiagnostics},
};

/// Run database migrations for the record store.
///
/// Creates the `kv_entries` table. [`SqliteStore::open`] calls this itself;
/// call it directly only when sharing a pool via [`SqliteStore::with_pool`].
pub async fn run_migrations(pool: &sqlx::SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .set_ignore_missing(true)
        .run(pool)
        .await?;
    Ok(())
}
