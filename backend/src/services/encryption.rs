//! Encryption of provider configuration at rest.
//!
//! Provider configuration carries transport secrets (FTP passwords, S3 keys,
//! OAuth refresh tokens). It is persisted as base64 of
//! `nonce (12 bytes) || AES-256-GCM ciphertext+tag`, keyed by an HMAC-SHA256
//! derivation of the application key.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use serde_json::{Map, Value};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Errors that can occur during encryption operations
#[derive(Error, Debug)]
pub enum EncryptionError {
    #[error("Application key is empty")]
    MissingKey,

    #[error("Invalid ciphertext: too short")]
    CiphertextTooShort,

    #[error("Invalid ciphertext encoding")]
    InvalidEncoding,

    #[error("Decryption failed: wrong key or corrupted data")]
    DecryptionFailed,

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),
}

fn derive_key(app_key: &str) -> Result<[u8; 32], EncryptionError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(app_key.as_bytes())
        .map_err(|e| EncryptionError::EncryptionFailed(e.to_string()))?;
    mac.update(b"backup-keeper/provider-configuration/aes-256-gcm/v1");
    Ok(mac.finalize().into_bytes().into())
}

/// AES-256-GCM cipher for provider configuration blobs.
pub struct ConfigCipher {
    cipher: Aes256Gcm,
}

impl ConfigCipher {
    pub fn new(app_key: &str) -> Result<Self, EncryptionError> {
        if app_key.is_empty() {
            return Err(EncryptionError::MissingKey);
        }
        let key = derive_key(app_key)?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| EncryptionError::EncryptionFailed(e.to_string()))?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| EncryptionError::EncryptionFailed(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(EncryptionError::CiphertextTooShort);
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| EncryptionError::DecryptionFailed)
    }

    /// Encrypt a configuration map into its persisted text form.
    pub fn seal_configuration(&self, config: &Map<String, Value>) -> Result<String, EncryptionError> {
        let json = serde_json::to_vec(config)
            .map_err(|e| EncryptionError::EncryptionFailed(e.to_string()))?;
        Ok(STANDARD.encode(self.encrypt(&json)?))
    }

    /// Decrypt the persisted text form back into a configuration map.
    pub fn open_configuration(&self, sealed: &str) -> Result<Map<String, Value>, EncryptionError> {
        let raw = STANDARD
            .decode(sealed.trim())
            .map_err(|_| EncryptionError::InvalidEncoding)?;
        let plaintext = self.decrypt(&raw)?;
        serde_json::from_slice(&plaintext).map_err(|_| EncryptionError::DecryptionFailed)
    }
}
