//! At-rest encryption for auth secrets.
//!
//! AES-256-GCM with a key derived (HKDF-SHA256) from the machine identity.
//! Stored form: `enc:v1:` + base64(nonce || ciphertext).

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose, Engine};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

use crate::error::{Result, ServiceError};

const PREFIX: &str = "enc:v1:";
const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct SecretCipher {
    key: [u8; 32],
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCipher").finish_non_exhaustive()
    }
}

impl SecretCipher {
    pub fn from_material(material: &[u8]) -> Result<Self> {
        let hk = Hkdf::<Sha256>::new(Some(b"dufshub".as_slice()), material);
        let mut key = [0u8; 32];
        hk.expand(b"service-secret-encryption", &mut key)
            .map_err(|e| ServiceError::PersistenceError(format!("key derivation failed: {e}")))?;
        Ok(Self { key })
    }

    /// Key bound to this machine, so a copied config file does not leak secrets.
    pub fn for_this_machine() -> Result<Self> {
        let host = sysinfo::System::host_name().unwrap_or_default();
        let material = format!("{host}|{}|{}", std::env::consts::OS, std::env::consts::ARCH);
        Self::from_material(material.as_bytes())
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new(&self.key.into());
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|e| ServiceError::PersistenceError(format!("encryption failed: {e}")))?;

        let mut blob = nonce_bytes.to_vec();
        blob.extend_from_slice(&ciphertext);
        Ok(format!("{PREFIX}{}", general_purpose::STANDARD.encode(blob)))
    }

    /// Values without the prefix are legacy plaintext and pass through unchanged.
    pub fn decrypt(&self, stored: &str) -> Result<String> {
        let Some(encoded) = stored.strip_prefix(PREFIX) else {
            return Ok(stored.to_string());
        };
        let data = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| ServiceError::PersistenceError(format!("invalid base64: {e}")))?;
        if data.len() < NONCE_LEN {
            return Err(ServiceError::PersistenceError("truncated secret".into()));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);

        let cipher = Aes256Gcm::new(&self.key.into());
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| ServiceError::PersistenceError(format!("decryption failed: {e}")))?;
        String::from_utf8(plaintext)
            .map_err(|e| ServiceError::PersistenceError(format!("invalid utf8: {e}")))
    }
}
