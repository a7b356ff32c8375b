//! Recovery phrase surface.
//!
//! Reserved for exporting the master key as a human-readable phrase and
//! re-importing it on another device. Disabled: both operations always
//! fail with [`VaultError::NotSupported`].

use crate::{
    error::{Result, VaultError},
    master_key::MasterKey,
};

/// Whether recovery phrases are available in this build.
pub const RECOVERY_PHRASE_ENABLED: bool = false;

const DISABLED: &str = "recovery phrases are disabled";

/// A phrase shown to the user once. Never constructed while
/// [`RECOVERY_PHRASE_ENABLED`] is false.
pub struct RecoveryPhrase {
    phrase: String,
}

impl RecoveryPhrase {
    pub fn phrase(&self) -> &str {
        &self.phrase
    }
}

impl std::fmt::Debug for RecoveryPhrase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RecoveryPhrase(..)")
    }
}

pub fn export_recovery_phrase(_key: &MasterKey) -> Result<RecoveryPhrase> {
    Err(VaultError::NotSupported(DISABLED))
}

pub fn import_from_recovery_phrase(_phrase: &str) -> Result<MasterKey> {
    Err(VaultError::NotSupported(DISABLED))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovery_is_inert() {
        assert!(!RECOVERY_PHRASE_ENABLED);
        assert!(matches!(
            export_recovery_phrase(&MasterKey::from_bytes([1; 32])),
            Err(VaultError::NotSupported(_))
        ));
        assert!(matches!(
            import_from_recovery_phrase("ABCD-EFGH"),
            Err(VaultError::NotSupported(_))
        ));
    }
}
