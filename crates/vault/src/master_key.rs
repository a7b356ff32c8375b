//! Master key lifecycle: first-run generation, wrap and persist, unwrap
//! with strategy fallback, expiring cache, self-validation, reset.

use std::{
    fmt,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use {
    rand::{TryRngCore, rngs::OsRng},
    serde::{Deserialize, Serialize},
    serde_json::Value,
    tokio::sync::Mutex,
    zeroize::Zeroizing,
};

#[cfg(feature = "metrics")]
use recordseal_metrics::{counter, vault as vault_metrics};

use crate::{
    aes256gcm::Aes256GcmCipher,
    device::{DeviceKeyDeriver, KeyDerivationStrategy},
    error::{Result, VaultError},
    key_cache::KeyCache,
    key_wrap,
    record::is_encrypted,
    store::{KeyValueStore, StoreName, WriteBatch, keys},
    traits::Cipher,
};

/// Format version of the persisted [`WrappedMasterKey`].
const WRAPPED_KEY_FORMAT: u8 = 1;

/// Plaintext used to prove a freshly created key encrypts and decrypts.
const SELF_TEST_PROBE: &[u8] = b"recordseal-master-key-self-test";

/// The device's symmetric master key.
///
/// Cloning shares the same zeroizing allocation. Raw bytes are only
/// reachable inside this crate.
#[derive(Clone)]
pub struct MasterKey(Arc<Zeroizing<[u8; 32]>>);

impl MasterKey {
    #[cfg(test)]
    pub(crate) fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Arc::new(Zeroizing::new(bytes)))
    }

    fn from_zeroizing(bytes: Zeroizing<[u8; 32]>) -> Self {
        Self(Arc::new(bytes))
    }

    pub(crate) fn bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

/// Persisted form of the wrapped master key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrappedMasterKey {
    pub version: u8,
    pub algorithm: String,
    /// Base64 `[version tag][nonce][ciphertext + tag]`.
    pub wrapped: String,
    pub created_at_ms: u64,
}

/// What [`MasterKeyManager::initialize_key_system`] ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// A stored key passed its health check.
    Existing,
    /// No key existed; a new one was created.
    Created,
    /// The stored key was unusable and nothing depended on it, so it was
    /// replaced.
    Recreated,
}

/// Read-only key system report for support tooling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KeyDiagnostics {
    pub capability_supported: bool,
    pub key_exists: bool,
    pub key_well_formed: bool,
    pub salt_exists: bool,
    pub unwrap_succeeds: bool,
    /// Strategy that opened the key, when one did.
    pub unwrap_strategy: Option<KeyDerivationStrategy>,
    pub problems: Vec<String>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Owns the single master key of this device.
///
/// Generic over [`Cipher`] but defaults to [`Aes256GcmCipher`].
pub struct MasterKeyManager<C: Cipher = Aes256GcmCipher> {
    store: Arc<dyn KeyValueStore>,
    deriver: DeviceKeyDeriver,
    cipher: C,
    cache: KeyCache,
    /// Serializes creation, unwrap-on-miss and reset.
    lifecycle: Mutex<()>,
}

impl MasterKeyManager<Aes256GcmCipher> {
    pub fn new(store: Arc<dyn KeyValueStore>, deriver: DeviceKeyDeriver, cache_ttl: Duration) -> Self {
        Self::with_cipher(store, deriver, Aes256GcmCipher, cache_ttl)
    }
}

impl<C: Cipher> MasterKeyManager<C> {
    pub fn with_cipher(
        store: Arc<dyn KeyValueStore>,
        deriver: DeviceKeyDeriver,
        cipher: C,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            store,
            deriver,
            cipher,
            cache: KeyCache::new(cache_ttl),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn cipher(&self) -> &C {
        &self.cipher
    }

    pub fn cache(&self) -> &KeyCache {
        &self.cache
    }

    /// Make sure a usable master key exists, creating one on first run.
    ///
    /// A stored key is health-checked by unwrapping it. If that fails and
    /// the blob is structurally corrupt, or no encrypted record depends on
    /// it, the key is wiped and recreated. If encrypted records exist the
    /// failure is surfaced as [`VaultError::KeyUnwrap`] instead: only an
    /// explicit, confirmed reset may destroy recoverable data.
    pub async fn initialize_key_system(&self) -> Result<InitOutcome> {
        let _guard = self.lifecycle.lock().await;
        self.initialize_locked().await
    }

    async fn initialize_locked(&self) -> Result<InitOutcome> {
        self.ensure_supported().await?;

        let Some(stored) = self.load_wrapped().await? else {
            self.create_key().await?;
            return Ok(InitOutcome::Created);
        };

        match self.unwrap_with_fallback(&stored).await {
            Ok(key) => {
                self.cache.insert(key);
                #[cfg(feature = "tracing")]
                tracing::info!("master key health check passed");
                return Ok(InitOutcome::Existing);
            },
            Err(VaultError::KeyUnwrap { reason }) => {
                let malformed = !self.stored_is_well_formed(&stored);
                if !malformed && self.has_encrypted_records().await? {
                    return Err(VaultError::key_unwrap(reason));
                }
                #[cfg(feature = "tracing")]
                tracing::warn!(malformed, %reason, "stored master key is unusable, wiping and recreating");
            },
            Err(e) => return Err(e),
        }

        self.store
            .delete(StoreName::Keys, keys::MASTER_KEY_WRAPPED)
            .await?;
        self.cache.clear();
        self.create_key().await?;
        Ok(InitOutcome::Recreated)
    }

    /// Return the master key, from cache when possible.
    ///
    /// On a miss the stored key is unwrapped (current strategy, then
    /// legacy). If no key exists at all, the key system is initialized once
    /// and the lookup retried exactly once.
    pub async fn get_master_key(&self) -> Result<MasterKey> {
        if let Some(key) = self.cache.get() {
            #[cfg(feature = "metrics")]
            counter!(vault_metrics::KEY_CACHE_HITS_TOTAL).increment(1);
            return Ok(key);
        }
        #[cfg(feature = "metrics")]
        counter!(vault_metrics::KEY_CACHE_MISSES_TOTAL).increment(1);

        let _guard = self.lifecycle.lock().await;
        let mut initialized = false;
        loop {
            // Another caller may have filled the cache while we waited.
            if let Some(key) = self.cache.get() {
                return Ok(key);
            }

            match self.load_wrapped().await? {
                Some(stored) => {
                    return self
                        .cache
                        .get_or_derive(|| self.unwrap_with_fallback(&stored))
                        .await;
                },
                None if !initialized => {
                    initialized = true;
                    self.initialize_locked().await?;
                },
                None => return Err(VaultError::NotInitialized),
            }
        }
    }

    /// Irreversibly delete the cached key and all persisted key material.
    ///
    /// Every record encrypted under the old key becomes unrecoverable.
    pub async fn reset_key_system(&self, confirmed: bool) -> Result<()> {
        if !confirmed {
            return Err(VaultError::ResetNotConfirmed);
        }

        let _guard = self.lifecycle.lock().await;
        self.cache.clear();

        let mut batch = WriteBatch::new();
        batch
            .delete(StoreName::Keys, keys::MASTER_KEY_WRAPPED)
            .delete(StoreName::Keys, keys::DEVICE_SALT);
        self.store.apply(batch).await?;

        #[cfg(feature = "metrics")]
        counter!(vault_metrics::KEY_RESETS_TOTAL).increment(1);
        #[cfg(feature = "tracing")]
        tracing::warn!(target: "recordseal::audit", "key system reset: all key material deleted");

        Ok(())
    }

    /// Report on the key system without mutating anything. Never fails.
    pub async fn diagnose(&self) -> KeyDiagnostics {
        let mut report = KeyDiagnostics::default();

        match self.check_supported().await {
            Ok(()) => report.capability_supported = true,
            Err(e) => report.problems.push(e.to_string()),
        }

        match self.deriver.salt_exists().await {
            Ok(exists) => report.salt_exists = exists,
            Err(e) => report.problems.push(format!("reading device salt: {e}")),
        }

        let stored = match self.load_wrapped().await {
            Ok(stored) => stored,
            Err(e) => {
                report.problems.push(format!("reading wrapped key: {e}"));
                None
            },
        };
        let Some(stored) = stored else {
            return report;
        };
        report.key_exists = true;
        report.key_well_formed = self.stored_is_well_formed(&stored);
        if !report.key_well_formed {
            report.problems.push("wrapped key is malformed".into());
            return report;
        }

        match self.try_strategies(&stored, false).await {
            Ok((_, strategy)) => {
                report.unwrap_succeeds = true;
                report.unwrap_strategy = Some(strategy);
            },
            Err(e) => report.problems.push(e.to_string()),
        }
        report
    }

    /// Probe for a secure random source and a reachable store.
    pub async fn ensure_supported(&self) -> Result<()> {
        self.check_supported().await
    }

    async fn check_supported(&self) -> Result<()> {
        let mut probe = [0u8; 16];
        OsRng
            .try_fill_bytes(&mut probe)
            .map_err(|e| VaultError::EncryptionSupport(format!("no secure random source: {e}")))?;
        self.store.ping().await.map_err(|e| match e {
            VaultError::EncryptionSupport(_) => e,
            other => VaultError::EncryptionSupport(format!("storage unavailable: {other}")),
        })
    }

    async fn create_key(&self) -> Result<()> {
        let mut bytes = Zeroizing::new([0u8; 32]);
        OsRng
            .try_fill_bytes(bytes.as_mut())
            .map_err(|e| VaultError::EncryptionSupport(format!("no secure random source: {e}")))?;

        let wrapping_key = self
            .deriver
            .derive_wrapping_key(KeyDerivationStrategy::Current)
            .await?;
        let wrapped = key_wrap::wrap_key(&self.cipher, wrapping_key.bytes(), &bytes)?;

        let record = WrappedMasterKey {
            version: WRAPPED_KEY_FORMAT,
            algorithm: self.cipher.algorithm().to_string(),
            wrapped,
            created_at_ms: now_ms(),
        };
        self.store
            .put(
                StoreName::Keys,
                keys::MASTER_KEY_WRAPPED,
                &serde_json::to_value(&record)?,
            )
            .await?;

        let key = MasterKey::from_zeroizing(bytes);
        if let Err(e) = self.self_test(&key).await {
            // Never leave an unusable key behind.
            let _ = self
                .store
                .delete(StoreName::Keys, keys::MASTER_KEY_WRAPPED)
                .await;
            #[cfg(feature = "tracing")]
            tracing::error!(error = %e, "master key self-test failed, key wiped");
            return Err(VaultError::SelfTestFailed(e.to_string()));
        }

        self.cache.insert(key);

        #[cfg(feature = "tracing")]
        tracing::info!(algorithm = self.cipher.algorithm(), "master key created");
        Ok(())
    }

    /// Re-read what was just persisted, unwrap it with a freshly derived
    /// wrapping key, and prove it round-trips data.
    async fn self_test(&self, expected: &MasterKey) -> Result<()> {
        let stored = self
            .load_wrapped()
            .await?
            .ok_or_else(|| VaultError::CipherError("wrapped key vanished after write".into()))?;
        let (unwrapped, _) = self.try_strategies(&stored, false).await?;
        if unwrapped.bytes() != expected.bytes() {
            return Err(VaultError::CipherError(
                "unwrapped key differs from generated key".into(),
            ));
        }

        let sealed = self
            .cipher
            .encrypt(unwrapped.bytes(), SELF_TEST_PROBE, b"self-test")?;
        let opened =
            self.cipher
                .decrypt(unwrapped.bytes(), &sealed.nonce, &sealed.ciphertext, b"self-test")?;
        if opened != SELF_TEST_PROBE {
            return Err(VaultError::CipherError("self-test probe mismatch".into()));
        }
        Ok(())
    }

    async fn unwrap_with_fallback(&self, stored: &Value) -> Result<MasterKey> {
        let (key, _) = self.try_strategies(stored, true).await?;
        Ok(key)
    }

    /// Try each strategy in [`KeyDerivationStrategy::FALLBACK_ORDER`];
    /// the first that unwraps wins. Storage errors propagate unchanged,
    /// unwrap failures collapse into [`VaultError::KeyUnwrap`].
    async fn try_strategies(
        &self,
        stored: &Value,
        audit: bool,
    ) -> Result<(MasterKey, KeyDerivationStrategy)> {
        let wrapped = wrapped_blob(stored)
            .ok_or_else(|| VaultError::key_unwrap("stored wrapped key is malformed"))?;

        let mut failures = Vec::new();
        for strategy in KeyDerivationStrategy::FALLBACK_ORDER {
            let Some(wrapping_key) = self.deriver.derive_existing(strategy).await? else {
                return Err(VaultError::key_unwrap("device salt is missing"));
            };
            match key_wrap::unwrap_key(&self.cipher, wrapping_key.bytes(), wrapped) {
                Ok(bytes) => {
                    if audit && strategy == KeyDerivationStrategy::Legacy {
                        self.audit_legacy_unwrap(&failures);
                    }
                    return Ok((MasterKey::from_zeroizing(bytes), strategy));
                },
                Err(e) => failures.push(format!("{strategy}: {e}")),
            }
        }

        Err(VaultError::key_unwrap(failures.join("; ")))
    }

    #[allow(unused_variables)]
    fn audit_legacy_unwrap(&self, failures: &[String]) {
        #[cfg(feature = "metrics")]
        counter!(vault_metrics::LEGACY_UNWRAP_TOTAL).increment(1);
        #[cfg(feature = "tracing")]
        tracing::warn!(
            target: "recordseal::audit",
            preceding_failures = ?failures,
            "master key unwrapped via legacy derivation strategy"
        );
    }

    fn stored_is_well_formed(&self, stored: &Value) -> bool {
        wrapped_blob(stored).is_some_and(|b64| key_wrap::is_well_formed(&self.cipher, b64))
    }

    async fn load_wrapped(&self) -> Result<Option<Value>> {
        self.store
            .get(StoreName::Keys, keys::MASTER_KEY_WRAPPED)
            .await
    }

    async fn has_encrypted_records(&self) -> Result<bool> {
        Ok(self
            .store
            .get_all(StoreName::Records)
            .await?
            .iter()
            .any(|(_, record)| is_encrypted(record)))
    }
}

/// The base64 blob inside a stored value. Bare strings are accepted as the
/// pre-metadata format.
fn wrapped_blob(stored: &Value) -> Option<&str> {
    match stored {
        Value::String(b64) => Some(b64),
        Value::Object(map) => map.get("wrapped").and_then(Value::as_str),
        _ => None,
    }
}
