//! Device-bound wrapping key derivation.
//!
//! The wrapping key is PBKDF2 over a persisted random device salt and a
//! passphrase. The `Current` passphrase embeds a fingerprint built only from
//! stable environment attributes; the `Legacy` passphrase is a fixed
//! constant kept solely to open material created before fingerprints.

use std::{fmt, sync::Arc, time::Instant};

use {
    chrono::{Datelike, Local, Offset, TimeZone},
    serde_json::Value,
    zeroize::Zeroizing,
};

#[cfg(feature = "metrics")]
use recordseal_metrics::{histogram, vault as vault_metrics};

use crate::{
    error::{Result, VaultError},
    kdf::{self, SALT_LEN},
    store::{KeyValueStore, StoreName, keys},
};

/// Prefix of the `Current` passphrase; bump when the fingerprint recipe changes.
const FINGERPRINT_VERSION: &str = "recordseal-device-v2";

/// Fixed passphrase of the pre-fingerprint scheme.
const LEGACY_PASSPHRASE: &str = "recordseal-local-master-key-v1";

/// How the wrapping key passphrase is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyDerivationStrategy {
    Current,
    Legacy,
}

impl KeyDerivationStrategy {
    /// Unwrap order: first success wins.
    pub const FALLBACK_ORDER: [Self; 2] = [Self::Current, Self::Legacy];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Current => "current",
            Self::Legacy => "legacy",
        }
    }
}

impl fmt::Display for KeyDerivationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable environment attributes mixed into the `Current` passphrase.
///
/// Nothing here depends on terminal or window geometry, so the derived key
/// does not change with UI state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFingerprint {
    pub platform: String,
    pub locale: String,
    pub logical_cores: usize,
    /// Standard-time UTC offset in minutes (DST-independent).
    pub utc_offset_minutes: i32,
    pub client_id: String,
}

impl DeviceFingerprint {
    /// Read the fingerprint attributes from the running environment.
    pub fn detect(client_id: impl Into<String>) -> Self {
        Self {
            platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            locale: detect_locale(),
            logical_cores: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            utc_offset_minutes: standard_utc_offset_minutes(),
            client_id: client_id.into(),
        }
    }

    fn canonical(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.platform, self.locale, self.logical_cores, self.utc_offset_minutes, self.client_id
        )
    }
}

fn detect_locale() -> String {
    ["LC_ALL", "LC_MESSAGES", "LANG"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|v| !v.is_empty())
        // `en_US.UTF-8@euro` -> `en_US`
        .map(|v| {
            v.split(['.', '@'])
                .next()
                .unwrap_or_default()
                .to_string()
        })
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "und".to_string())
}

/// The smaller of the January and July offsets is standard time in both
/// hemispheres, so DST transitions do not move the fingerprint.
fn standard_utc_offset_minutes() -> i32 {
    let year = Local::now().year();
    [1, 7]
        .into_iter()
        .filter_map(|month| Local.with_ymd_and_hms(year, month, 1, 12, 0, 0).single())
        .map(|dt| dt.offset().fix().local_minus_utc() / 60)
        .min()
        .unwrap_or(0)
}

/// A key used only to wrap and unwrap the master key.
pub struct WrappingKey(Zeroizing<[u8; 32]>);

impl WrappingKey {
    pub(crate) fn bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for WrappingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WrappingKey(..)")
    }
}

/// Derives wrapping keys from the device salt and fingerprint.
pub struct DeviceKeyDeriver {
    store: Arc<dyn KeyValueStore>,
    fingerprint: DeviceFingerprint,
    iterations: u32,
}

impl DeviceKeyDeriver {
    /// Create a deriver. Rejects iteration counts below
    /// [`recordseal_config::MIN_KDF_ITERATIONS`].
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        fingerprint: DeviceFingerprint,
        iterations: u32,
    ) -> Result<Self> {
        if iterations < recordseal_config::MIN_KDF_ITERATIONS {
            return Err(VaultError::EncryptionSupport(format!(
                "{iterations} KDF iterations is below the minimum of {}",
                recordseal_config::MIN_KDF_ITERATIONS
            )));
        }
        Ok(Self {
            store,
            fingerprint,
            iterations,
        })
    }

    /// Low-iteration deriver so unit tests stay fast.
    #[cfg(test)]
    pub(crate) fn for_tests(store: Arc<dyn KeyValueStore>, fingerprint: DeviceFingerprint) -> Self {
        Self {
            store,
            fingerprint,
            iterations: 1_000,
        }
    }

    pub fn fingerprint(&self) -> &DeviceFingerprint {
        &self.fingerprint
    }

    /// Derive the wrapping key for `strategy`, creating the device salt on
    /// first use.
    pub async fn derive_wrapping_key(&self, strategy: KeyDerivationStrategy) -> Result<WrappingKey> {
        let salt = self.load_or_create_salt().await?;
        self.derive_with_salt(strategy, salt).await
    }

    /// Like [`derive_wrapping_key`](Self::derive_wrapping_key) but never
    /// writes: returns `None` when no salt exists yet.
    pub async fn derive_existing(
        &self,
        strategy: KeyDerivationStrategy,
    ) -> Result<Option<WrappingKey>> {
        match self.load_salt().await? {
            Some(salt) => Ok(Some(self.derive_with_salt(strategy, salt).await?)),
            None => Ok(None),
        }
    }

    /// Whether a device salt is persisted.
    pub async fn salt_exists(&self) -> Result<bool> {
        Ok(self
            .store
            .get(StoreName::Keys, keys::DEVICE_SALT)
            .await?
            .is_some())
    }

    async fn derive_with_salt(
        &self,
        strategy: KeyDerivationStrategy,
        salt: [u8; SALT_LEN],
    ) -> Result<WrappingKey> {
        let passphrase = self.passphrase(strategy);
        let iterations = self.iterations;
        let started = Instant::now();

        // PBKDF2 is CPU bound; keep it off the async workers.
        let key = tokio::task::spawn_blocking(move || {
            kdf::derive_key(passphrase.as_bytes(), &salt, iterations)
        })
        .await
        .map_err(|e| VaultError::CipherError(format!("key derivation task failed: {e}")))?;

        #[cfg(feature = "metrics")]
        histogram!(vault_metrics::KDF_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        #[cfg(feature = "tracing")]
        tracing::debug!(
            strategy = %strategy,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "derived wrapping key"
        );
        #[cfg(not(any(feature = "metrics", feature = "tracing")))]
        let _ = started;

        Ok(WrappingKey(key))
    }

    fn passphrase(&self, strategy: KeyDerivationStrategy) -> Zeroizing<String> {
        Zeroizing::new(match strategy {
            KeyDerivationStrategy::Current => {
                format!("{FINGERPRINT_VERSION}|{}", self.fingerprint.canonical())
            },
            KeyDerivationStrategy::Legacy => LEGACY_PASSPHRASE.to_string(),
        })
    }

    async fn load_salt(&self) -> Result<Option<[u8; SALT_LEN]>> {
        match self.store.get(StoreName::Keys, keys::DEVICE_SALT).await? {
            Some(Value::String(b64)) => Ok(Some(kdf::decode_salt(&b64)?)),
            Some(_) => Err(VaultError::CipherError(
                "device salt is not a base64 string".into(),
            )),
            None => Ok(None),
        }
    }

    async fn load_or_create_salt(&self) -> Result<[u8; SALT_LEN]> {
        if let Some(salt) = self.load_salt().await? {
            return Ok(salt);
        }

        let b64 = kdf::generate_salt();
        self.store
            .put(StoreName::Keys, keys::DEVICE_SALT, &Value::String(b64.clone()))
            .await?;

        #[cfg(feature = "tracing")]
        tracing::info!("created device salt");

        kdf::decode_salt(&b64)
    }
}
