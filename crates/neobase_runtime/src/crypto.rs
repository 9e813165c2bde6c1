//! Field-level credential encryption.
//!
//! Passwords and SSL material are encrypted independently with AES-256-GCM
//! under the process-wide `SCHEMA_ENCRYPTION_KEY`. Each field gets a fresh
//! random 96-bit nonce; the stored payload is base64(nonce ‖ ciphertext ‖ tag)
//! so a field round-trips without any external state.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{NeoError, NeoResult};

const NONCE_LEN: usize = 12;

/// An encrypted field as persisted: opaque base64 payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncryptedField(pub String);

/// Process-wide symmetric cipher. Constructed once at boot and shared by
/// reference; the key never leaves this struct.
#[derive(Clone)]
pub struct FieldCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldCipher").finish_non_exhaustive()
    }
}

impl FieldCipher {
    /// Derives a 256-bit key from the configured secret. The secret is
    /// treated as a passphrase, not raw key bytes, so any length works.
    pub fn from_secret(secret: &str) -> NeoResult<Self> {
        if secret.is_empty() {
            return Err(NeoError::config("SCHEMA_ENCRYPTION_KEY must not be empty"));
        }
        let digest = Sha256::digest(secret.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(&digest);
        Ok(Self { cipher: Aes256Gcm::new(key) })
    }

    pub fn encrypt(&self, plaintext: &str) -> NeoResult<EncryptedField> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| NeoError::internal("field encryption failed"))?;

        let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&ciphertext);
        Ok(EncryptedField(BASE64.encode(payload)))
    }

    pub fn decrypt(&self, field: &EncryptedField) -> NeoResult<String> {
        let payload = BASE64
            .decode(&field.0)
            .map_err(|_| NeoError::config("encrypted field is not valid base64"))?;
        if payload.len() <= NONCE_LEN {
            return Err(NeoError::config("encrypted field payload too short"));
        }
        let (nonce_bytes, ciphertext) = payload.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| NeoError::config("encrypted field failed authentication"))?;
        String::from_utf8(plaintext)
            .map_err(|_| NeoError::config("decrypted field is not valid UTF-8"))
    }

    pub fn encrypt_opt(&self, plaintext: Option<&str>) -> NeoResult<Option<EncryptedField>> {
        plaintext.map(|p| self.encrypt(p)).transpose()
    }

    pub fn decrypt_opt(&self, field: Option<&EncryptedField>) -> NeoResult<Option<String>> {
        field.map(|f| self.decrypt(f)).transpose()
    }
}
