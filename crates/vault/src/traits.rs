//! Cipher trait for swappable authenticated encryption backends.

use crate::error::VaultError;

/// Output of a single AEAD seal: the nonce and `ciphertext || tag`.
#[derive(Debug, Clone)]
pub struct Sealed {
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// Authenticated encryption with associated data.
///
/// Each implementation has a version tag (stored with wrapped keys) and an
/// algorithm name (stored in record envelopes) so blobs stay attributable
/// to the cipher that produced them.
pub trait Cipher: Send + Sync {
    /// Unique identifier for this cipher, written as the first byte of
    /// wrapped key blobs.
    fn version_tag(&self) -> u8;

    /// Algorithm name recorded in record envelopes.
    fn algorithm(&self) -> &'static str;

    /// Nonce length in bytes.
    fn nonce_len(&self) -> usize;

    /// Encrypt `plaintext` under `key` with a fresh random nonce.
    fn encrypt(&self, key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Sealed, VaultError>;

    /// Decrypt `ciphertext` (including its tag). Any authentication failure
    /// is reported as [`VaultError::DecryptionAuth`].
    fn decrypt(
        &self,
        key: &[u8; 32],
        nonce: &[u8],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, VaultError>;
}
