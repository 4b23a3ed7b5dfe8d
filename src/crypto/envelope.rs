//! Hybrid envelope: KEM-derived key wraps an AEAD ciphertext, the whole
//! payload is signed with a post-quantum signature.

use super::keys::KeyStore;
use crate::error::{DbError, DbResult};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use pqcrypto_dilithium::dilithium3;
use pqcrypto_kyber::kyber768;
use pqcrypto_traits::kem::{
    Ciphertext as KemCiphertextTrait, PublicKey as KemPublicKeyTrait,
    SecretKey as KemSecretKeyTrait, SharedSecret as KemSharedSecretTrait,
};
use pqcrypto_traits::sign::DetachedSignature as DetachedSignatureTrait;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const NONCE_SIZE: usize = 12;

/// The encrypted payload: KEM ciphertext, AEAD nonce, and AEAD ciphertext,
/// concatenated and base64-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    pub key_id: String,
    pub algorithm: String,
    pub ciphertext: String,
}

/// The signed envelope, as it is stored on disk / sent on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub payload: Payload,
    pub signature: String,
}

fn payload_bytes(payload: &Payload) -> DbResult<Vec<u8>> {
    Ok(serde_json::to_vec(payload)?)
}

fn symmetric_key_from_shared_secret(secret: &[u8]) -> [u8; 32] {
    if secret.len() == 32 {
        let mut out = [0u8; 32];
        out.copy_from_slice(secret);
        out
    } else {
        let mut hasher = Sha256::new();
        hasher.update(secret);
        hasher.finalize().into()
    }
}

/// Encrypts `plaintext` under `key_id`'s public KEM key, then signs the
/// payload with the same key's signature key.
pub fn encrypt(store: &KeyStore, key_id: &str, plaintext: &[u8]) -> DbResult<SignedEnvelope> {
    store.require_usable(key_id)?;
    let record = store.get(key_id)?;

    let (shared_secret, kem_ciphertext) = kyber768::encapsulate(&record.kem_public);
    let symmetric_key = symmetric_key_from_shared_secret(shared_secret.as_bytes());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let cipher = Aes256Gcm::new(symmetric_key.as_slice().into());
    let aead_ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| DbError::conflict("aead encryption failed"))?;

    let mut combined = Vec::with_capacity(
        kem_ciphertext.as_bytes().len() + NONCE_SIZE + aead_ciphertext.len(),
    );
    combined.extend_from_slice(kem_ciphertext.as_bytes());
    combined.extend_from_slice(&nonce_bytes);
    combined.extend_from_slice(&aead_ciphertext);

    let payload = Payload {
        key_id: key_id.to_string(),
        algorithm: "kyber768+aes256gcm".to_string(),
        ciphertext: BASE64.encode(&combined),
    };

    let signature = dilithium3::detached_sign(&payload_bytes(&payload)?, &record.sign_secret);

    Ok(SignedEnvelope {
        payload,
        signature: BASE64.encode(signature.as_bytes()),
    })
}

/// Verifies the signature first; only on success does it attempt
/// decryption. Never returns partial plaintext on failure.
pub fn decrypt(store: &KeyStore, envelope: &SignedEnvelope) -> DbResult<Vec<u8>> {
    let record = store.get(&envelope.payload.key_id)?;
    store.require_usable(&envelope.payload.key_id)?;

    let signature_bytes = BASE64
        .decode(&envelope.signature)
        .map_err(|_| DbError::SignatureInvalid)?;
    let signature = dilithium3::DetachedSignature::from_bytes(&signature_bytes)
        .map_err(|_| DbError::SignatureInvalid)?;
    let message = payload_bytes(&envelope.payload)?;
    dilithium3::verify_detached_signature(&signature, &message, &record.sign_public)
        .map_err(|_| DbError::SignatureInvalid)?;

    let combined = BASE64
        .decode(&envelope.payload.ciphertext)
        .map_err(|_| DbError::conflict("invalid envelope encoding"))?;

    let kem_ct_len = kyber768::ciphertext_bytes();
    if combined.len() < kem_ct_len + NONCE_SIZE {
        return Err(DbError::conflict("envelope too short"));
    }
    let (kem_ct_bytes, rest) = combined.split_at(kem_ct_len);
    let (nonce_bytes, aead_ciphertext) = rest.split_at(NONCE_SIZE);

    let kem_ciphertext = kyber768::Ciphertext::from_bytes(kem_ct_bytes)
        .map_err(|_| DbError::conflict("invalid kem ciphertext"))?;
    let shared_secret = kyber768::decapsulate(&kem_ciphertext, &record.kem_secret);
    let symmetric_key = symmetric_key_from_shared_secret(shared_secret.as_bytes());

    let cipher = Aes256Gcm::new(symmetric_key.as_slice().into());
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), aead_ciphertext)
        .map_err(|_| DbError::conflict("decryption failed: wrong key or tampered data"))
}
