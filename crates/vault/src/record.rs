//! Field-level record encryption.
//!
//! A record is a JSON object. Configured sensitive fields (and sensitive
//! sub-fields of each item of one list field) are pulled out into a
//! [`SensitivePayload`], sealed as a single AEAD ciphertext and stored next
//! to the public fields as an [`EncryptedRecord`].

use std::collections::HashSet;

use {
    base64::Engine as _,
    recordseal_config::FieldsConfig,
    serde::{Deserialize, Serialize},
    serde_json::{Map, Value},
    sha2::{Digest, Sha256},
    zeroize::Zeroizing,
};

#[cfg(feature = "metrics")]
use recordseal_metrics::{counter, vault as vault_metrics};

use crate::{
    aes256gcm::{self, Aes256GcmCipher},
    error::{Result, VaultError},
    master_key::MasterKey,
    traits::Cipher,
};

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// Current envelope format.
pub const ENVELOPE_VERSION: u8 = 1;

/// Keys an [`EncryptedRecord`] adds on top of the public fields.
pub const RESERVED_KEYS: [&str; 3] = ["envelope", "encryptedData", "checksum"];

/// Everything needed to open the ciphertext, minus the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u8,
    pub algorithm: String,
    /// Base64 nonce.
    pub iv: String,
}

/// Persisted form of a record: public fields inline plus the sealed
/// sensitive payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedRecord {
    #[serde(flatten)]
    pub public: Map<String, Value>,
    pub envelope: Envelope,
    /// Base64 `ciphertext || tag`.
    pub encrypted_data: String,
    /// Hex SHA-256 of `encrypted_data`. Advisory only.
    pub checksum: String,
}

impl EncryptedRecord {
    pub fn from_value(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| VaultError::MalformedEnvelope(e.to_string()))
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn id(&self) -> Result<String> {
        id_of(&self.public)
    }
}

/// Sensitive scalars plus, per list item and in list order, that item's
/// sensitive sub-fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensitivePayload {
    pub fields: Map<String, Value>,
    pub items: Vec<Map<String, Value>>,
}

#[derive(Debug, Clone, Copy)]
pub struct DecryptOptions {
    pub warn_on_checksum_mismatch: bool,
}

impl Default for DecryptOptions {
    fn default() -> Self {
        Self {
            warn_on_checksum_mismatch: true,
        }
    }
}

/// Non-fatal findings reported next to a successfully decrypted record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntegrityWarning {
    ChecksumMismatch {
        record_id: String,
        stored: String,
        computed: String,
    },
}

impl std::fmt::Display for IntegrityWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ChecksumMismatch { record_id, .. } => {
                write!(f, "checksum mismatch on record {record_id}")
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decrypted {
    pub record: Value,
    pub warnings: Vec<IntegrityWarning>,
}

/// True when `record` carries a well-formed envelope and ciphertext.
pub fn is_encrypted(record: &Value) -> bool {
    let Some(obj) = record.as_object() else {
        return false;
    };
    let Some(envelope) = obj.get("envelope").and_then(Value::as_object) else {
        return false;
    };
    let version_ok = envelope.get("version").and_then(Value::as_u64) == Some(ENVELOPE_VERSION.into());
    let algorithm_ok = envelope
        .get("algorithm")
        .and_then(Value::as_str)
        .is_some_and(|a| !a.is_empty());
    let iv_ok = envelope
        .get("iv")
        .and_then(Value::as_str)
        .and_then(|iv| B64.decode(iv).ok())
        .is_some_and(|iv| iv.len() == aes256gcm::NONCE_LEN);
    let data_ok = obj
        .get("encryptedData")
        .and_then(Value::as_str)
        .and_then(|data| B64.decode(data).ok())
        .is_some_and(|data| data.len() >= aes256gcm::TAG_LEN);

    version_ok && algorithm_ok && iv_ok && data_ok
}

/// Hex SHA-256 of the base64 ciphertext string.
pub fn checksum(encrypted_data: &str) -> String {
    Sha256::digest(encrypted_data.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn id_of(fields: &Map<String, Value>) -> Result<String> {
    match fields.get("id") {
        Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        Some(Value::Number(id)) => Ok(id.to_string()),
        _ => Err(VaultError::InvalidRecord("record has no usable id".into())),
    }
}

/// Id of a plaintext or encrypted record value.
pub fn record_id(record: &Value) -> Result<String> {
    let obj = record
        .as_object()
        .ok_or_else(|| VaultError::InvalidRecord("record is not an object".into()))?;
    id_of(obj)
}

fn aad_for(id: &str) -> Vec<u8> {
    format!("record:{id}").into_bytes()
}

/// Stateless record transform. Holds only the cipher and field layout.
pub struct RecordCipher<C: Cipher = Aes256GcmCipher> {
    cipher: C,
    sensitive: HashSet<String>,
    list_field: String,
    list_item_sensitive: HashSet<String>,
}

impl RecordCipher<Aes256GcmCipher> {
    pub fn new(fields: &FieldsConfig) -> Self {
        Self::with_cipher(Aes256GcmCipher, fields)
    }
}

impl<C: Cipher> RecordCipher<C> {
    pub fn with_cipher(cipher: C, fields: &FieldsConfig) -> Self {
        Self {
            cipher,
            sensitive: fields.sensitive.iter().cloned().collect(),
            list_field: fields.list_field.clone(),
            list_item_sensitive: fields.list_item_sensitive.iter().cloned().collect(),
        }
    }

    /// Split a record into public fields and its sensitive payload.
    pub fn separate(&self, record: &Value) -> Result<(Map<String, Value>, SensitivePayload)> {
        let mut public = record
            .as_object()
            .cloned()
            .ok_or_else(|| VaultError::InvalidRecord("record is not an object".into()))?;

        let mut payload = SensitivePayload::default();
        for name in &self.sensitive {
            if let Some(value) = public.remove(name) {
                payload.fields.insert(name.clone(), value);
            }
        }

        if let Some(Value::Array(items)) = public.get_mut(&self.list_field) {
            payload.items = items
                .iter_mut()
                .map(|item| {
                    let mut secret = Map::new();
                    if let Some(item) = item.as_object_mut() {
                        for name in &self.list_item_sensitive {
                            if let Some(value) = item.remove(name) {
                                secret.insert(name.clone(), value);
                            }
                        }
                    }
                    secret
                })
                .collect();
        }

        Ok((public, payload))
    }

    /// Inverse of [`RecordCipher::separate`].
    pub fn merge(&self, public: Map<String, Value>, payload: SensitivePayload) -> Result<Value> {
        let mut record = public;

        if !payload.items.is_empty() {
            let Some(Value::Array(items)) = record.get_mut(&self.list_field) else {
                return Err(VaultError::InvalidRecord(format!(
                    "payload has list items but record has no `{}` list",
                    self.list_field
                )));
            };
            if items.len() != payload.items.len() {
                return Err(VaultError::InvalidRecord(format!(
                    "`{}` has {} items, payload has {}",
                    self.list_field,
                    items.len(),
                    payload.items.len()
                )));
            }
            for (item, secret) in items.iter_mut().zip(payload.items) {
                match item.as_object_mut() {
                    Some(item) => item.extend(secret),
                    None if secret.is_empty() => {},
                    None => {
                        return Err(VaultError::InvalidRecord(format!(
                            "`{}` item is not an object",
                            self.list_field
                        )));
                    },
                }
            }
        }

        record.extend(payload.fields);
        Ok(Value::Object(record))
    }

    pub fn encrypt(&self, record: &Value, key: &MasterKey) -> Result<EncryptedRecord> {
        let id = record_id(record)?;
        if let Some(obj) = record.as_object()
            && let Some(reserved) = RESERVED_KEYS.iter().find(|k| obj.contains_key(**k))
        {
            return Err(VaultError::InvalidRecord(format!(
                "record {id} uses reserved field `{reserved}`"
            )));
        }

        let (public, payload) = self.separate(record)?;
        let plaintext = Zeroizing::new(serde_json::to_vec(&payload)?);
        let sealed = self.cipher.encrypt(key.bytes(), &plaintext, &aad_for(&id))?;

        let encrypted_data = B64.encode(&sealed.ciphertext);
        let encrypted = EncryptedRecord {
            public,
            envelope: Envelope {
                version: ENVELOPE_VERSION,
                algorithm: self.cipher.algorithm().to_string(),
                iv: B64.encode(&sealed.nonce),
            },
            checksum: checksum(&encrypted_data),
            encrypted_data,
        };

        #[cfg(feature = "metrics")]
        counter!(vault_metrics::RECORDS_ENCRYPTED_TOTAL).increment(1);

        Ok(encrypted)
    }

    /// Open an encrypted record.
    ///
    /// A checksum mismatch is reported as a warning, never an error; only
    /// the AEAD tag decides whether the record is trusted.
    pub fn decrypt(
        &self,
        encrypted: &EncryptedRecord,
        key: &MasterKey,
        opts: DecryptOptions,
    ) -> Result<Decrypted> {
        let id = encrypted.id()?;
        let envelope = &encrypted.envelope;
        if envelope.version != ENVELOPE_VERSION {
            return Err(VaultError::MalformedEnvelope(format!(
                "unsupported envelope version {}",
                envelope.version
            )));
        }
        if envelope.algorithm != self.cipher.algorithm() {
            return Err(VaultError::MalformedEnvelope(format!(
                "unsupported algorithm {}",
                envelope.algorithm
            )));
        }

        let mut warnings = Vec::new();
        let computed = checksum(&encrypted.encrypted_data);
        if opts.warn_on_checksum_mismatch && computed != encrypted.checksum {
            #[cfg(feature = "metrics")]
            counter!(vault_metrics::CHECKSUM_MISMATCH_TOTAL).increment(1);
            #[cfg(feature = "tracing")]
            tracing::warn!(record_id = %id, "record checksum mismatch, relying on AEAD tag");
            warnings.push(IntegrityWarning::ChecksumMismatch {
                record_id: id.clone(),
                stored: encrypted.checksum.clone(),
                computed,
            });
        }

        let plaintext = self.open(encrypted, key, &id).inspect_err(|_| {
            #[cfg(feature = "metrics")]
            counter!(vault_metrics::DECRYPT_FAILURES_TOTAL).increment(1);
        })?;
        let payload: SensitivePayload = serde_json::from_slice(&plaintext)
            .map_err(|e| VaultError::MalformedEnvelope(format!("payload: {e}")))?;
        let record = self.merge(encrypted.public.clone(), payload)?;

        #[cfg(feature = "metrics")]
        counter!(vault_metrics::RECORDS_DECRYPTED_TOTAL).increment(1);

        Ok(Decrypted { record, warnings })
    }

    /// Parse a stored value and decrypt it.
    pub fn decrypt_value(&self, value: &Value, key: &MasterKey, opts: DecryptOptions) -> Result<Decrypted> {
        self.decrypt(&EncryptedRecord::from_value(value)?, key, opts)
    }

    fn open(&self, encrypted: &EncryptedRecord, key: &MasterKey, id: &str) -> Result<Zeroizing<Vec<u8>>> {
        // Undecodable ciphertext or nonce is tampering like any other.
        let nonce = B64
            .decode(&encrypted.envelope.iv)
            .map_err(|_| VaultError::DecryptionAuth)?;
        let ciphertext = B64
            .decode(&encrypted.encrypted_data)
            .map_err(|_| VaultError::DecryptionAuth)?;
        let plaintext = self
            .cipher
            .decrypt(key.bytes(), &nonce, &ciphertext, &aad_for(id))?;
        Ok(Zeroizing::new(plaintext))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    fn cipher() -> RecordCipher {
        RecordCipher::new(&FieldsConfig::default())
    }

    fn key(byte: u8) -> MasterKey {
        MasterKey::from_bytes([byte; 32])
    }

    fn round_trip(record: Value) {
        let cipher = cipher();
        let k = key(1);
        let encrypted = cipher.encrypt(&record, &k).unwrap();
        let decrypted = cipher.decrypt(&encrypted, &k, DecryptOptions::default()).unwrap();
        assert_eq!(decrypted.record, record);
        assert!(decrypted.warnings.is_empty());
    }

    fn flip_b64_byte(b64: &str, index: usize) -> String {
        let mut bytes = B64.decode(b64).unwrap();
        bytes[index] ^= 0x01;
        B64.encode(bytes)
    }

    #[test]
    fn separate_and_merge_are_inverse() {
        let cipher = cipher();
        let record = json!({
            "id": "r1",
            "person1": "Ada",
            "status": "open",
            "services": [
                {"kind": "care", "notes": "n", "provider": "p"},
                "not-an-object",
                {"kind": "other"}
            ]
        });
        let (public, payload) = cipher.separate(&record).unwrap();

        assert_eq!(public.get("status"), Some(&json!("open")));
        assert!(public.get("person1").is_none());
        assert_eq!(public["services"][0], json!({"kind": "care"}));
        assert_eq!(payload.fields.get("person1"), Some(&json!("Ada")));
        assert_eq!(payload.items.len(), 3);
        assert!(payload.items[1].is_empty() && payload.items[2].is_empty());

        assert_eq!(cipher.merge(public, payload).unwrap(), record);
    }

    #[test]
    fn non_array_list_field_stays_public() {
        let cipher = cipher();
        let record = json!({"id": 7, "services": "none"});
        let (public, payload) = cipher.separate(&record).unwrap();
        assert_eq!(public.get("services"), Some(&json!("none")));
        assert!(payload.items.is_empty());
    }

    #[test]
    fn round_trips_unicode_empty_and_lists() {
        round_trip(json!({"id": "u", "person1": "Zoë 李 🚀", "notes": ""}));
        round_trip(json!({"id": "e", "person2": null, "address": {}}));
        round_trip(json!({"id": "l0", "services": []}));
        round_trip(json!({"id": "l1", "services": [{"notes": "one"}]}));
        round_trip(json!({
            "id": 42,
            "services": (0..25).map(|i| json!({"notes": format!("n{i}"), "description": "d", "kind": i})).collect::<Vec<_>>()
        }));
    }

    #[test]
    fn round_trips_floats_exactly() {
        round_trip(json!({"id": "r", "notes": 0.11475424859373685}));
        round_trip(json!({
            "id": "f",
            "person1": -1.7976931348623157e308,
            "address": {"lat": 48.858_370_2, "lng": 2.294_481_3},
            "services": [{"notes": 5e-324, "kind": 0.1}]
        }));
    }

    #[test]
    fn concrete_record_never_leaks_plaintext() {
        let cipher = cipher();
        let k = key(3);
        let record = json!({"id": "r1", "person1": "José Núñez", "services": [{"notes": "critical"}]});

        let encrypted = cipher.encrypt(&record, &k).unwrap();
        assert!(!encrypted.encrypted_data.contains("José"));
        assert!(!encrypted.encrypted_data.contains("critical"));
        let stored = serde_json::to_string(&encrypted).unwrap();
        assert!(!stored.contains("José") && !stored.contains("critical"));

        let value = encrypted.to_value().unwrap();
        assert!(is_encrypted(&value));
        let decrypted = cipher.decrypt_value(&value, &k, DecryptOptions::default()).unwrap();
        assert_eq!(decrypted.record, record);
    }

    #[test]
    fn nonces_and_ciphertexts_are_unique() {
        let cipher = cipher();
        let k = key(1);
        let record = json!({"id": "r", "person1": "same"});
        let mut ivs = HashSet::new();
        let mut datas = HashSet::new();
        for _ in 0..64 {
            let e = cipher.encrypt(&record, &k).unwrap();
            ivs.insert(e.envelope.iv);
            datas.insert(e.encrypted_data);
        }
        assert_eq!(ivs.len(), 64);
        assert_eq!(datas.len(), 64);
    }

    #[test]
    fn tampered_payload_fails_authentication() {
        let cipher = cipher();
        let k = key(1);
        let encrypted = cipher
            .encrypt(&json!({"id": "r", "person1": "x", "services": [{"notes": "y"}]}), &k)
            .unwrap();
        let len = B64.decode(&encrypted.encrypted_data).unwrap().len();

        for index in [0, len / 2, len - 1] {
            let mut tampered = encrypted.clone();
            tampered.encrypted_data = flip_b64_byte(&encrypted.encrypted_data, index);
            tampered.checksum = checksum(&tampered.encrypted_data);
            let err = cipher.decrypt(&tampered, &k, DecryptOptions::default()).unwrap_err();
            assert!(matches!(err, VaultError::DecryptionAuth), "index {index}: {err}");
        }
    }

    #[test]
    fn tampered_nonce_fails_authentication() {
        let cipher = cipher();
        let k = key(1);
        let encrypted = cipher.encrypt(&json!({"id": "r", "phone": "1"}), &k).unwrap();

        for index in 0..aes256gcm::NONCE_LEN {
            let mut tampered = encrypted.clone();
            tampered.envelope.iv = flip_b64_byte(&encrypted.envelope.iv, index);
            assert!(matches!(
                cipher.decrypt(&tampered, &k, DecryptOptions::default()),
                Err(VaultError::DecryptionAuth)
            ));
        }
    }

    #[test]
    fn wrong_key_is_rejected() {
        let cipher = cipher();
        let encrypted = cipher.encrypt(&json!({"id": "r", "email": "a@b"}), &key(1)).unwrap();
        assert!(matches!(
            cipher.decrypt(&encrypted, &key(2), DecryptOptions::default()),
            Err(VaultError::DecryptionAuth)
        ));
    }

    #[test]
    fn ciphertext_is_bound_to_record_id() {
        let cipher = cipher();
        let k = key(1);
        let mut encrypted = cipher.encrypt(&json!({"id": "a", "email": "a@b"}), &k).unwrap();
        encrypted.public.insert("id".into(), json!("b"));
        assert!(matches!(
            cipher.decrypt(&encrypted, &k, DecryptOptions::default()),
            Err(VaultError::DecryptionAuth)
        ));
    }

    #[test]
    fn checksum_is_advisory() {
        let cipher = cipher();
        let k = key(1);
        let record = json!({"id": "r", "notes": "keep"});
        let mut encrypted = cipher.encrypt(&record, &k).unwrap();
        encrypted.checksum = "deadbeef".into();

        let decrypted = cipher.decrypt(&encrypted, &k, DecryptOptions::default()).unwrap();
        assert_eq!(decrypted.record, record);
        assert!(matches!(
            decrypted.warnings.as_slice(),
            [IntegrityWarning::ChecksumMismatch { record_id, .. }] if record_id == "r"
        ));

        let quiet = cipher
            .decrypt(&encrypted, &k, DecryptOptions {
                warn_on_checksum_mismatch: false,
            })
            .unwrap();
        assert!(quiet.warnings.is_empty());
    }

    #[test]
    fn envelope_mismatches_are_malformed() {
        let cipher = cipher();
        let k = key(1);
        let encrypted = cipher.encrypt(&json!({"id": "r"}), &k).unwrap();

        let mut wrong_version = encrypted.clone();
        wrong_version.envelope.version = 9;
        assert!(matches!(
            cipher.decrypt(&wrong_version, &k, DecryptOptions::default()),
            Err(VaultError::MalformedEnvelope(_))
        ));

        let mut wrong_alg = encrypted;
        wrong_alg.envelope.algorithm = "ROT13".into();
        assert!(matches!(
            cipher.decrypt(&wrong_alg, &k, DecryptOptions::default()),
            Err(VaultError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn encrypt_rejects_invalid_records() {
        let cipher = cipher();
        let k = key(1);
        assert!(matches!(cipher.encrypt(&json!([1]), &k), Err(VaultError::InvalidRecord(_))));
        assert!(matches!(cipher.encrypt(&json!({"person1": "x"}), &k), Err(VaultError::InvalidRecord(_))));
        assert!(matches!(
            cipher.encrypt(&json!({"id": "r", "checksum": "x"}), &k),
            Err(VaultError::InvalidRecord(_))
        ));
    }

    #[test]
    fn is_encrypted_detects_envelopes() {
        assert!(!is_encrypted(&json!({"id": "r", "person1": "plain"})));
        assert!(!is_encrypted(&json!("string")));
        assert!(!is_encrypted(&json!({
            "id": "r",
            "envelope": {"version": 1, "algorithm": "AES-GCM-256", "iv": "short"},
            "encryptedData": "AAAAAAAAAAAAAAAAAAAAAA=="
        })));
        assert!(is_encrypted(&json!({
            "id": "r",
            "envelope": {"version": 1, "algorithm": "AES-GCM-256", "iv": "AAAAAAAAAAAAAAAA"},
            "encryptedData": "AAAAAAAAAAAAAAAAAAAAAA=="
        })));
    }
}
