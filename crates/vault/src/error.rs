//! Vault error types.

/// Guidance attached to [`VaultError::KeyUnwrap`]; an unwrap failure is never
/// resolved automatically because resetting would destroy recoverable data.
pub const KEY_UNWRAP_GUIDANCE: &str = "reload the application; if the problem persists, an explicit \
     confirmed key reset is required and records encrypted under the old key will be lost";

/// Errors produced by vault operations.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// The environment lacks a required cryptographic or storage capability.
    #[error("encryption not supported in this environment: {0}")]
    EncryptionSupport(String),

    /// The wrapped master key could not be unwrapped with any strategy.
    #[error("key unwrap failed: {reason}; {}", KEY_UNWRAP_GUIDANCE)]
    KeyUnwrap { reason: String },

    /// No master key has been created yet.
    #[error("key system is not initialized")]
    NotInitialized,

    /// A freshly written wrapped key could not be unwrapped again.
    #[error("key self-test failed: {0}")]
    SelfTestFailed(String),

    /// Destructive reset requested without explicit confirmation.
    #[error("key reset requires explicit confirmation")]
    ResetNotConfirmed,

    /// AEAD tag verification failed (wrong key, corrupted ciphertext or nonce).
    #[error("decryption failed: authentication tag mismatch")]
    DecryptionAuth,

    /// The record's encryption envelope is missing or malformed.
    #[error("malformed encryption envelope: {0}")]
    MalformedEnvelope(String),

    /// The record cannot be processed (not an object, missing id, ...).
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// Storage rejected a write for capacity reasons.
    #[error("storage quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The safety backup could not be created or validated.
    #[error("backup failed: {0}")]
    BackupFailed(String),

    /// Reserved surface that is intentionally inert.
    #[error("not supported: {0}")]
    NotSupported(&'static str),

    /// Encryption or key-wrapping primitive failed.
    #[error("cipher error: {0}")]
    CipherError(String),

    /// Generic storage failure.
    #[error("storage error: {0}")]
    Store(String),

    /// Base64 decoding failed.
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration runner error.
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// JSON serialization / deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// File I/O error (backup export / import).
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Generic error wrapper.
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl VaultError {
    #[must_use]
    pub fn key_unwrap(reason: impl Into<String>) -> Self {
        Self::KeyUnwrap {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    /// Whether a later attempt could plausibly succeed without any change
    /// to the data itself (storage hiccups, capacity freed up).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Store(_) | Self::Database(_) | Self::QuotaExceeded(_) | Self::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwrap_error_carries_guidance() {
        let msg = VaultError::key_unwrap("wrong device").to_string();
        assert!(msg.contains("wrong device"));
        assert!(msg.contains("explicit confirmed key reset"));
    }

    #[test]
    fn transient_classification() {
        assert!(VaultError::store("busy").is_transient());
        assert!(VaultError::QuotaExceeded("full".into()).is_transient());
        assert!(!VaultError::DecryptionAuth.is_transient());
        assert!(!VaultError::InvalidRecord("no id".into()).is_transient());
    }
}
