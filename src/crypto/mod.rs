//! Field-level hybrid post-quantum encryption at rest.

pub mod envelope;
pub mod keys;

use crate::document::{DistributedDocument, EntryType};
use crate::error::{DbError, DbResult};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use keys::{derive_key, DerivedKey, KdfParams, KeyRecord, KeyState, KeyStore, Salt};
use pqcrypto_dilithium::dilithium3;
use pqcrypto_kyber::kyber768;
use pqcrypto_traits::kem::{PublicKey as KemPublicKeyTrait, SecretKey as KemSecretKeyTrait};
use pqcrypto_traits::sign::{PublicKey as SignPublicKeyTrait, SecretKey as SignSecretKeyTrait};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::path::Path;

/// Declares, per entry type, which payload fields must never touch disk
/// or the wire in cleartext.
pub fn sensitive_fields(entry_type: EntryType) -> &'static [&'static str] {
    match entry_type {
        EntryType::Credential => &["hash", "salt"],
        EntryType::PQCKey => &["private_key"],
        EntryType::Session => &["token_hash"],
        EntryType::Audit => &["details"],
        _ => &[],
    }
}

const MASTER_KEY_ID: &str = "master";

/// Owns the key store and applies the sensitive-field policy to documents
/// on their way to and from storage.
pub struct EncryptionManager {
    keys: KeyStore,
}

impl EncryptionManager {
    pub fn new() -> Self {
        let keys = KeyStore::new();
        keys.insert(KeyRecord::generate(MASTER_KEY_ID));
        Self { keys }
    }

    /// Loads the master key from `<base_dir>/keys/master.json`, unwrapping
    /// it with `passphrase`; generates and persists one on first use. Runs
    /// fully in memory (a fresh key every call) when either is absent.
    pub fn open(base_dir: Option<&Path>, passphrase: Option<&str>) -> DbResult<Self> {
        let keys = KeyStore::new();
        match (base_dir, passphrase) {
            (Some(dir), Some(passphrase)) => {
                let path = dir.join("keys").join(format!("{MASTER_KEY_ID}.json"));
                let record = if path.exists() {
                    load_key_record(&path, passphrase)?
                } else {
                    let record = KeyRecord::generate(MASTER_KEY_ID);
                    persist_key_record(&path, &record, passphrase)?;
                    record
                };
                keys.insert(record);
            }
            _ => keys.insert(KeyRecord::generate(MASTER_KEY_ID)),
        }
        Ok(Self { keys })
    }

    pub fn key_store(&self) -> &KeyStore {
        &self.keys
    }

    /// Encrypts every sensitive field of `doc` in place, returning the
    /// key id used. Fields are replaced with a base64 envelope and a
    /// `<field>_encrypted` marker.
    pub fn seal(&self, doc: &mut DistributedDocument) -> DbResult<()> {
        let fields = sensitive_fields(doc.entry_type);
        if fields.is_empty() {
            return Ok(());
        }
        let Some(payload) = doc.payload.as_mut() else {
            return Ok(());
        };
        for field in fields {
            if let Some(value) = payload.remove(*field) {
                let plaintext = serde_json::to_vec(&value)?;
                let envelope = envelope::encrypt(&self.keys, MASTER_KEY_ID, &plaintext)?;
                payload.insert(field.to_string(), json!(BASE64.encode(serde_json::to_vec(&envelope)?)));
                payload.insert(format!("{field}_encrypted"), json!(true));
            }
        }
        Ok(())
    }

    /// Reverses `seal`, decrypting every field marked `<field>_encrypted`.
    pub fn unseal(&self, doc: &mut DistributedDocument) -> DbResult<()> {
        let fields = sensitive_fields(doc.entry_type);
        if fields.is_empty() {
            return Ok(());
        }
        let Some(payload) = doc.payload.as_mut() else {
            return Ok(());
        };
        for field in fields {
            let marker = format!("{field}_encrypted");
            if payload.remove(&marker).is_none() {
                continue;
            }
            let Some(JsonValue::String(encoded)) = payload.get(*field) else {
                continue;
            };
            let envelope_bytes = BASE64
                .decode(encoded)
                .map_err(|_| DbError::conflict("invalid envelope encoding"))?;
            let envelope: envelope::SignedEnvelope = serde_json::from_slice(&envelope_bytes)?;
            let plaintext = envelope::decrypt(&self.keys, &envelope)?;
            let value: JsonValue = serde_json::from_slice(&plaintext)?;
            payload.insert(field.to_string(), value);
        }
        Ok(())
    }
}

impl Default for EncryptionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Wraps arbitrary private-key bytes with a passphrase-derived AES-256-GCM
/// key so master key material is never persisted in cleartext.
pub struct WrappedSecret {
    pub salt: [u8; 16],
    pub nonce: [u8; 12],
    pub ciphertext: Vec<u8>,
}

pub fn wrap_secret(passphrase: &str, plaintext: &[u8]) -> DbResult<WrappedSecret> {
    let salt = Salt::random();
    let key = derive_key(passphrase, &salt, &KdfParams::default())?;
    let mut nonce = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    let cipher = Aes256Gcm::new(key.as_bytes().as_slice().into());
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| DbError::conflict("failed to wrap secret"))?;
    Ok(WrappedSecret {
        salt: salt.bytes,
        nonce,
        ciphertext,
    })
}

pub fn unwrap_secret(passphrase: &str, wrapped: &WrappedSecret) -> DbResult<Vec<u8>> {
    let salt = Salt { bytes: wrapped.salt };
    let key: DerivedKey = derive_key(passphrase, &salt, &KdfParams::default())?;
    let cipher = Aes256Gcm::new(key.as_bytes().as_slice().into());
    cipher
        .decrypt(Nonce::from_slice(&wrapped.nonce), wrapped.ciphertext.as_ref())
        .map_err(|_| DbError::conflict("failed to unwrap secret: wrong passphrase"))
}

#[derive(Serialize, Deserialize)]
struct WrappedSecretEncoded {
    salt: String,
    nonce: String,
    ciphertext: String,
}

impl WrappedSecretEncoded {
    fn encode(wrapped: &WrappedSecret) -> Self {
        Self {
            salt: BASE64.encode(wrapped.salt),
            nonce: BASE64.encode(wrapped.nonce),
            ciphertext: BASE64.encode(&wrapped.ciphertext),
        }
    }

    fn decode(&self) -> DbResult<WrappedSecret> {
        let salt = BASE64.decode(&self.salt).map_err(|_| DbError::conflict("invalid salt encoding"))?;
        let nonce = BASE64.decode(&self.nonce).map_err(|_| DbError::conflict("invalid nonce encoding"))?;
        let ciphertext = BASE64
            .decode(&self.ciphertext)
            .map_err(|_| DbError::conflict("invalid ciphertext encoding"))?;
        let mut salt_bytes = [0u8; 16];
        salt_bytes.copy_from_slice(&salt);
        let mut nonce_bytes = [0u8; 12];
        nonce_bytes.copy_from_slice(&nonce);
        Ok(WrappedSecret {
            salt: salt_bytes,
            nonce: nonce_bytes,
            ciphertext,
        })
    }
}

/// On-disk shape of `<base>/keys/<id>.json`: public material in the
/// clear, private material wrapped under the caller's passphrase.
#[derive(Serialize, Deserialize)]
struct PersistedKeyRecord {
    id: String,
    state: String,
    kem_public: String,
    sign_public: String,
    kem_secret: WrappedSecretEncoded,
    sign_secret: WrappedSecretEncoded,
}

fn key_state_from_str(s: &str) -> KeyState {
    match s {
        "rotated" => KeyState::Rotated,
        "revoked" => KeyState::Revoked,
        "expired" => KeyState::Expired,
        _ => KeyState::Active,
    }
}

fn persist_key_record(path: &Path, record: &KeyRecord, passphrase: &str) -> DbResult<()> {
    let persisted = PersistedKeyRecord {
        id: record.id.clone(),
        state: record.state.to_string(),
        kem_public: BASE64.encode(record.kem_public_bytes()),
        sign_public: BASE64.encode(record.sign_public_bytes()),
        kem_secret: WrappedSecretEncoded::encode(&wrap_secret(passphrase, record.kem_secret_bytes())?),
        sign_secret: WrappedSecretEncoded::encode(&wrap_secret(passphrase, record.sign_secret_bytes())?),
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_vec_pretty(&persisted)?)?;
    Ok(())
}

fn load_key_record(path: &Path, passphrase: &str) -> DbResult<KeyRecord> {
    let bytes = std::fs::read(path)?;
    let persisted: PersistedKeyRecord = serde_json::from_slice(&bytes)?;

    let kem_secret_bytes = unwrap_secret(passphrase, &persisted.kem_secret.decode()?)?;
    let sign_secret_bytes = unwrap_secret(passphrase, &persisted.sign_secret.decode()?)?;
    let kem_public_bytes = BASE64
        .decode(&persisted.kem_public)
        .map_err(|_| DbError::conflict("invalid kem public key encoding"))?;
    let sign_public_bytes = BASE64
        .decode(&persisted.sign_public)
        .map_err(|_| DbError::conflict("invalid signature public key encoding"))?;

    Ok(KeyRecord {
        id: persisted.id,
        state: key_state_from_str(&persisted.state),
        kem_public: kyber768::PublicKey::from_bytes(&kem_public_bytes)
            .map_err(|_| DbError::conflict("invalid kem public key"))?,
        kem_secret: kyber768::SecretKey::from_bytes(&kem_secret_bytes)
            .map_err(|_| DbError::conflict("invalid kem secret key"))?,
        sign_public: dilithium3::PublicKey::from_bytes(&sign_public_bytes)
            .map_err(|_| DbError::conflict("invalid signature public key"))?,
        sign_secret: dilithium3::SecretKey::from_bytes(&sign_secret_bytes)
            .map_err(|_| DbError::conflict("invalid signature secret key"))?,
    })
}
