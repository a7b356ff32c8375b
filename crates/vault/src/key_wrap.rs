//! Master key wrapping / unwrapping using the [`Cipher`] trait.
//!
//! Wrapped blob layout (base64): `[version tag][nonce][ciphertext + tag]`.
//! The AAD is fixed to `"master-key-wrap"` to domain-separate key wrapping
//! from record encryption.

use {base64::Engine, zeroize::Zeroizing};

use crate::{error::VaultError, traits::Cipher};

/// AAD used for key wrapping, distinct from record encryption AAD.
const WRAP_AAD: &[u8] = b"master-key-wrap";

/// AEAD tag length shared by every supported cipher.
const TAG_LEN: usize = 16;

/// Wrap (encrypt) a master key with a wrapping key.
///
/// Returns the wrapped blob as base64, prefixed with the cipher's version tag.
pub fn wrap_key<C: Cipher>(
    cipher: &C,
    wrapping_key: &[u8; 32],
    master_key: &[u8; 32],
) -> Result<String, VaultError> {
    let sealed = cipher.encrypt(wrapping_key, master_key, WRAP_AAD)?;

    let mut blob = Vec::with_capacity(1 + sealed.nonce.len() + sealed.ciphertext.len());
    blob.push(cipher.version_tag());
    blob.extend_from_slice(&sealed.nonce);
    blob.extend_from_slice(&sealed.ciphertext);

    Ok(base64::engine::general_purpose::STANDARD.encode(blob))
}

/// Unwrap (decrypt) a master key from a base64 wrapped blob.
pub fn unwrap_key<C: Cipher>(
    cipher: &C,
    wrapping_key: &[u8; 32],
    wrapped_b64: &str,
) -> Result<Zeroizing<[u8; 32]>, VaultError> {
    let blob = decode_checked(cipher, wrapped_b64)?;
    let (nonce, ciphertext) = blob[1..].split_at(cipher.nonce_len());

    let plaintext = Zeroizing::new(cipher.decrypt(wrapping_key, nonce, ciphertext, WRAP_AAD)?);

    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&plaintext);
    Ok(key)
}

/// Structural check of a wrapped blob without any key material.
pub fn is_well_formed<C: Cipher>(cipher: &C, wrapped_b64: &str) -> bool {
    decode_checked(cipher, wrapped_b64).is_ok()
}

fn decode_checked<C: Cipher>(cipher: &C, wrapped_b64: &str) -> Result<Vec<u8>, VaultError> {
    let blob = base64::engine::general_purpose::STANDARD.decode(wrapped_b64)?;

    let Some(&version) = blob.first() else {
        return Err(VaultError::CipherError("empty wrapped key".to_string()));
    };
    if version != cipher.version_tag() {
        return Err(VaultError::CipherError(format!(
            "unsupported cipher version: {version:#04x}, expected {:#04x}",
            cipher.version_tag()
        )));
    }

    let expected = 1 + cipher.nonce_len() + 32 + TAG_LEN;
    if blob.len() != expected {
        return Err(VaultError::CipherError(format!(
            "wrapped key has wrong length: {} (expected {expected})",
            blob.len()
        )));
    }

    Ok(blob)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, crate::aes256gcm::Aes256GcmCipher};

    const WRAPPING: [u8; 32] = [0xAA; 32];
    const MASTER: [u8; 32] = [0xBB; 32];

    #[test]
    fn round_trip() {
        let wrapped = wrap_key(&Aes256GcmCipher, &WRAPPING, &MASTER).unwrap();
        assert!(is_well_formed(&Aes256GcmCipher, &wrapped));
        let unwrapped = unwrap_key(&Aes256GcmCipher, &WRAPPING, &wrapped).unwrap();
        assert_eq!(*unwrapped, MASTER);
    }

    #[test]
    fn wrong_wrapping_key_fails() {
        let wrapped = wrap_key(&Aes256GcmCipher, &WRAPPING, &MASTER).unwrap();
        let result = unwrap_key(&Aes256GcmCipher, &[0xCC; 32], &wrapped);
        assert!(matches!(result, Err(VaultError::DecryptionAuth)));
    }

    #[test]
    fn tampered_blob_fails() {
        let wrapped = wrap_key(&Aes256GcmCipher, &WRAPPING, &MASTER).unwrap();
        let mut blob = base64::engine::general_purpose::STANDARD
            .decode(&wrapped)
            .unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        let tampered = base64::engine::general_purpose::STANDARD.encode(&blob);

        assert!(is_well_formed(&Aes256GcmCipher, &tampered));
        assert!(unwrap_key(&Aes256GcmCipher, &WRAPPING, &tampered).is_err());
    }

    #[test]
    fn foreign_version_tag_rejected() {
        let wrapped = wrap_key(&Aes256GcmCipher, &WRAPPING, &MASTER).unwrap();
        let mut blob = base64::engine::general_purpose::STANDARD
            .decode(&wrapped)
            .unwrap();
        blob[0] = 0x01;
        let foreign = base64::engine::general_purpose::STANDARD.encode(&blob);

        assert!(!is_well_formed(&Aes256GcmCipher, &foreign));
        assert!(matches!(
            unwrap_key(&Aes256GcmCipher, &WRAPPING, &foreign),
            Err(VaultError::CipherError(_))
        ));
    }

    #[test]
    fn truncated_and_garbage_blobs_are_malformed() {
        assert!(!is_well_formed(&Aes256GcmCipher, ""));
        assert!(!is_well_formed(&Aes256GcmCipher, "not base64!"));
        let short = base64::engine::general_purpose::STANDARD.encode([0x02, 1, 2, 3]);
        assert!(!is_well_formed(&Aes256GcmCipher, &short));
    }

    #[test]
    fn wrapped_blob_has_version_prefix() {
        let wrapped = wrap_key(&Aes256GcmCipher, &WRAPPING, &MASTER).unwrap();
        let blob = base64::engine::general_purpose::STANDARD
            .decode(&wrapped)
            .unwrap();
        assert_eq!(blob[0], crate::aes256gcm::VERSION_TAG);
        assert_eq!(blob.len(), 1 + 12 + 32 + 16);
    }
}
