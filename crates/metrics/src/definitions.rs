//! Metric name definitions.
//!
//! All metric names emitted by recordseal live here so the exported surface
//! is documented in one place.

/// Key management and record encryption metrics
pub mod vault {
    /// Records sealed by the record cipher
    pub const RECORDS_ENCRYPTED_TOTAL: &str = "recordseal_records_encrypted_total";
    /// Records opened by the record cipher
    pub const RECORDS_DECRYPTED_TOTAL: &str = "recordseal_records_decrypted_total";
    /// Authenticated decryption failures (wrong key or tampered data)
    pub const DECRYPT_FAILURES_TOTAL: &str = "recordseal_decrypt_failures_total";
    /// Stored checksum did not match the ciphertext (advisory)
    pub const CHECKSUM_MISMATCH_TOTAL: &str = "recordseal_checksum_mismatch_total";
    /// Master key unwrapped only through the legacy derivation strategy
    pub const LEGACY_UNWRAP_TOTAL: &str = "recordseal_legacy_unwrap_total";
    /// Master key served from the in-process cache
    pub const KEY_CACHE_HITS_TOTAL: &str = "recordseal_key_cache_hits_total";
    /// Master key had to be unwrapped from storage
    pub const KEY_CACHE_MISSES_TOTAL: &str = "recordseal_key_cache_misses_total";
    /// Wrapping key derivation duration in seconds
    pub const KDF_DURATION_SECONDS: &str = "recordseal_kdf_duration_seconds";
    /// Key system resets performed
    pub const KEY_RESETS_TOTAL: &str = "recordseal_key_resets_total";
}

/// Plaintext-to-encrypted migration metrics
pub mod migration {
    /// Records migrated to encrypted form
    pub const RECORDS_MIGRATED_TOTAL: &str = "recordseal_migration_records_migrated_total";
    /// Records that exhausted their retry budget
    pub const RECORDS_FAILED_TOTAL: &str = "recordseal_migration_records_failed_total";
    /// Retries performed after a failed attempt
    pub const RETRIES_TOTAL: &str = "recordseal_migration_retries_total";
    /// Whole migration run duration in seconds
    pub const RUN_DURATION_SECONDS: &str = "recordseal_migration_run_duration_seconds";
}

/// Backup metrics
pub mod backup {
    /// Backups written
    pub const CREATED_TOTAL: &str = "recordseal_backups_created_total";
    /// Backups deleted by the retention policy
    pub const PRUNED_TOTAL: &str = "recordseal_backups_pruned_total";
    /// Backups rejected because their checksum did not validate
    pub const INVALID_TOTAL: &str = "recordseal_backups_invalid_total";
}

/// Histogram bucket boundaries
pub mod buckets {
    /// Key derivation and migration durations (seconds); PBKDF2 at 100k+
    /// iterations typically lands between 10ms and 1s.
    pub const CRYPTO_DURATION: [f64; 10] = [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 10.0];
}
