//! PBKDF2-HMAC-SHA256 key derivation and device salt helpers.

use {base64::Engine, pbkdf2::pbkdf2_hmac, rand::RngCore, sha2::Sha256, zeroize::Zeroizing};

use crate::error::VaultError;

/// Device salt length in bytes.
pub const SALT_LEN: usize = 32;

/// Derive a 256-bit key from a passphrase and salt.
pub fn derive_key(passphrase: &[u8], salt: &[u8], iterations: u32) -> Zeroizing<[u8; 32]> {
    let mut output = Zeroizing::new([0u8; 32]);
    pbkdf2_hmac::<Sha256>(passphrase, salt, iterations, output.as_mut());
    output
}

/// Generate a random device salt and return it as base64.
pub fn generate_salt() -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::rng().fill_bytes(&mut salt);
    base64::engine::general_purpose::STANDARD.encode(salt)
}

/// Decode a base64 device salt, rejecting anything that is not exactly
/// [`SALT_LEN`] bytes.
pub fn decode_salt(b64: &str) -> Result<[u8; SALT_LEN], VaultError> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(b64)?;
    bytes.as_slice().try_into().map_err(|_| {
        VaultError::CipherError(format!(
            "device salt has wrong length: {} (expected {SALT_LEN})",
            bytes.len()
        ))
    })
}
