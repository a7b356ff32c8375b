//! AES-256-GCM implementation of the [`Cipher`] trait.

#[allow(deprecated)] // upstream generic-array 0.x deprecation
use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use rand::RngCore;

use crate::{
    error::VaultError,
    traits::{Cipher, Sealed},
};

/// Version tag for AES-256-GCM.
pub const VERSION_TAG: u8 = 0x02;

/// Algorithm name written into record envelopes.
pub const ALGORITHM: &str = "AES-GCM-256";

/// 96-bit nonce.
pub const NONCE_LEN: usize = 12;

/// 128-bit authentication tag.
pub const TAG_LEN: usize = 16;

/// AES-256-GCM AEAD cipher. Nonces are drawn from the thread-local CSPRNG
/// on every call and never reused.
#[derive(Debug, Clone, Copy, Default)]
pub struct Aes256GcmCipher;

impl Cipher for Aes256GcmCipher {
    fn version_tag(&self) -> u8 {
        VERSION_TAG
    }

    fn algorithm(&self) -> &'static str {
        ALGORITHM
    }

    fn nonce_len(&self) -> usize {
        NONCE_LEN
    }

    #[allow(deprecated)]
    fn encrypt(&self, key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Sealed, VaultError> {
        let cipher = Aes256Gcm::new(key.into());

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), Payload {
                msg: plaintext,
                aad,
            })
            .map_err(|e| VaultError::CipherError(e.to_string()))?;

        Ok(Sealed {
            nonce: nonce_bytes.to_vec(),
            ciphertext,
        })
    }

    #[allow(deprecated)]
    fn decrypt(
        &self,
        key: &[u8; 32],
        nonce: &[u8],
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, VaultError> {
        if nonce.len() != NONCE_LEN || ciphertext.len() < TAG_LEN {
            return Err(VaultError::DecryptionAuth);
        }

        Aes256Gcm::new(key.into())
            .decrypt(Nonce::from_slice(nonce), Payload {
                msg: ciphertext,
                aad,
            })
            .map_err(|_| VaultError::DecryptionAuth)
    }
}
