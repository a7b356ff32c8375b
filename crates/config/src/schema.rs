//! Typed configuration schema.
//!
//! Every section is `#[serde(default)]` so a partial file only overrides
//! what it names.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Lowest PBKDF2 iteration count accepted for device key derivation.
pub const MIN_KDF_ITERATIONS: u32 = 100_000;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordsealConfig {
    pub storage: StorageConfig,
    pub keys: KeysConfig,
    pub migration: MigrationConfig,
    pub backup: BackupConfig,
    pub fields: FieldsConfig,
}

/// Where records, keys and backups are persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file. `None` resolves to `<data_dir>/recordseal.db`.
    pub database_path: Option<PathBuf>,
}

/// Master key lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// PBKDF2-HMAC-SHA256 iterations for the device wrapping key.
    pub kdf_iterations: u32,
    /// How long an unwrapped master key stays in the in-process cache.
    pub cache_ttl_secs: u64,
    /// Generic client identifier mixed into the device fingerprint.
    pub client_id: String,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            kdf_iterations: MIN_KDF_ITERATIONS,
            cache_ttl_secs: 300,
            client_id: "recordseal".into(),
        }
    }
}

/// Plaintext-to-encrypted migration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Attempts per record before it is reported as failed.
    pub max_attempts: u32,
    /// Backoff unit; attempt `n` waits `n * base_delay_ms` before retrying.
    pub base_delay_ms: u64,
    /// Emit a progress notification every N records.
    pub progress_every: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            progress_every: 10,
        }
    }
}

/// Backup retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Number of most recent backups kept; older ones are pruned.
    pub retention: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self { retention: 5 }
    }
}

/// Which record fields are sensitive and therefore encrypted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FieldsConfig {
    /// Sensitive top-level fields.
    pub sensitive: Vec<String>,
    /// Name of the list-valued field whose items carry sensitive sub-fields.
    pub list_field: String,
    /// Sensitive sub-fields of each list item.
    pub list_item_sensitive: Vec<String>,
}

impl Default for FieldsConfig {
    fn default() -> Self {
        Self {
            sensitive: [
                "person1",
                "person2",
                "address",
                "phone",
                "email",
                "dateOfBirth",
                "notes",
                "signature",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            list_field: "services".into(),
            list_item_sensitive: ["notes", "description", "provider"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}
