//! Key lifecycle and passphrase-based wrapping of master key material.

use crate::error::{DbError, DbResult};
use argon2::{Argon2, Params};
use dashmap::DashMap;
use pqcrypto_dilithium::dilithium3;
use pqcrypto_kyber::kyber768;
use pqcrypto_traits::kem::{PublicKey as KemPublicKeyTrait, SecretKey as KemSecretKeyTrait};
use pqcrypto_traits::sign::{PublicKey as SignPublicKeyTrait, SecretKey as SignSecretKeyTrait};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A key's position in its lifecycle. Rotation creates a new active key
/// without destroying the old one: documents encrypted under a rotated
/// key remain decryptable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Active,
    Rotated,
    Revoked,
    Expired,
}

impl std::fmt::Display for KeyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            KeyState::Active => "active",
            KeyState::Rotated => "rotated",
            KeyState::Revoked => "revoked",
            KeyState::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// 32 bytes of key material, zeroized on drop, never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey {
    bytes: [u8; 32],
}

impl DerivedKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKey").field("bytes", &"<redacted>").finish()
    }
}

#[derive(Clone)]
pub struct Salt {
    pub bytes: [u8; 16],
}

impl Salt {
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }
}

/// OWASP 2023 Argon2id recommendation: 19 MiB, 2 iterations, 1 lane.
#[derive(Clone, Copy)]
pub struct KdfParams {
    pub memory_cost_kib: u32,
    pub time_cost: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_cost_kib: 19 * 1024,
            time_cost: 2,
            parallelism: 1,
        }
    }
}

pub fn derive_key(passphrase: &str, salt: &Salt, params: &KdfParams) -> DbResult<DerivedKey> {
    let argon2_params = Params::new(
        params.memory_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(32),
    )
    .map_err(|e| DbError::conflict(format!("invalid kdf params: {e}")))?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, argon2_params);
    let mut bytes = [0u8; 32];
    argon2
        .hash_password_into(passphrase.as_bytes(), &salt.bytes, &mut bytes)
        .map_err(|e| DbError::conflict(format!("key derivation failed: {e}")))?;
    Ok(DerivedKey { bytes })
}

/// One key's material: a KEM pair for encapsulation and a signature pair
/// for tamper-evidence, plus lifecycle state.
pub struct KeyRecord {
    pub id: String,
    pub state: KeyState,
    pub kem_public: kyber768::PublicKey,
    pub kem_secret: kyber768::SecretKey,
    pub sign_public: dilithium3::PublicKey,
    pub sign_secret: dilithium3::SecretKey,
}

impl KeyRecord {
    pub fn generate(id: impl Into<String>) -> Self {
        let (kem_public, kem_secret) = kyber768::keypair();
        let (sign_public, sign_secret) = dilithium3::keypair();
        Self {
            id: id.into(),
            state: KeyState::Active,
            kem_public,
            kem_secret,
            sign_public,
            sign_secret,
        }
    }

    pub fn kem_public_bytes(&self) -> &[u8] {
        self.kem_public.as_bytes()
    }

    pub fn kem_secret_bytes(&self) -> &[u8] {
        self.kem_secret.as_bytes()
    }

    pub fn sign_public_bytes(&self) -> &[u8] {
        self.sign_public.as_bytes()
    }

    pub fn sign_secret_bytes(&self) -> &[u8] {
        self.sign_secret.as_bytes()
    }
}

/// Caches generated and loaded keys by id.
#[derive(Default)]
pub struct KeyStore {
    keys: DashMap<String, KeyRecord>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: KeyRecord) {
        self.keys.insert(record.id.clone(), record);
    }

    pub fn get(&self, id: &str) -> DbResult<dashmap::mapref::one::Ref<'_, String, KeyRecord>> {
        self.keys.get(id).ok_or_else(|| DbError::KeyMissing { key_id: id.to_string() })
    }

    pub fn require_usable(&self, id: &str) -> DbResult<()> {
        let record = self.get(id)?;
        match record.state {
            KeyState::Active | KeyState::Rotated => Ok(()),
            other => Err(DbError::KeyInactive {
                key_id: id.to_string(),
                state: other.to_string(),
            }),
        }
    }

    /// Marks `old_id` rotated and inserts a freshly generated key under
    /// `new_id`, which becomes the active key for new writes.
    pub fn rotate(&self, old_id: &str, new_id: impl Into<String>) -> DbResult<()> {
        if let Some(mut record) = self.keys.get_mut(old_id) {
            record.state = KeyState::Rotated;
        }
        self.insert(KeyRecord::generate(new_id));
        Ok(())
    }

    pub fn revoke(&self, id: &str) -> DbResult<()> {
        let mut record = self
            .keys
            .get_mut(id)
            .ok_or_else(|| DbError::KeyMissing { key_id: id.to_string() })?;
        record.state = KeyState::Revoked;
        Ok(())
    }

    /// Drops every cached key record. Used on shutdown so master key
    /// material doesn't outlive the `Database` handle in memory.
    pub fn clear(&self) {
        self.keys.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_key_is_deterministic_for_same_salt_and_passphrase() {
        let salt = Salt::random();
        let params = KdfParams::default();
        let a = derive_key("hunter2", &salt, &params).unwrap();
        let b = derive_key("hunter2", &salt, &params).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn different_salts_produce_different_keys() {
        let params = KdfParams::default();
        let a = derive_key("hunter2", &Salt::random(), &params).unwrap();
        let b = derive_key("hunter2", &Salt::random(), &params).unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn rotation_keeps_the_old_key_usable() {
        let store = KeyStore::new();
        store.insert(KeyRecord::generate("k1"));
        store.rotate("k1", "k2").unwrap();
        assert!(store.require_usable("k1").is_ok());
        assert!(store.require_usable("k2").is_ok());
    }

    #[test]
    fn revoked_key_is_not_usable() {
        let store = KeyStore::new();
        store.insert(KeyRecord::generate("k1"));
        store.revoke("k1").unwrap();
        assert!(matches!(store.require_usable("k1"), Err(DbError::KeyInactive { .. })));
    }

    #[test]
    fn missing_key_reports_key_missing() {
        let store = KeyStore::new();
        assert!(matches!(store.require_usable("ghost"), Err(DbError::KeyMissing { .. })));
    }
}
