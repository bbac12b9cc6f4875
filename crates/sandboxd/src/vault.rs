//! Credential vault: authenticated encryption for per-session API keys.
//!
//! Keys are stored as `base64(nonce || tag || ciphertext)` so a single text
//! column can hold them.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;

/// AES-256-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;
/// GCM authentication tag length in bytes.
const TAG_LEN: usize = 16;
/// Required master key length in bytes.
const KEY_LEN: usize = 32;

/// Errors from vault operations.
#[derive(Debug, Error)]
pub enum VaultError {
    /// The configured master key is too short for the cipher.
    #[error("encryption key must be at least {KEY_LEN} bytes")]
    InvalidKey,

    /// The ciphertext failed authentication (tampered or wrong key).
    #[error("decryption failed: ciphertext could not be authenticated")]
    AuthenticationFailed,
}

/// Authenticated-encryption wrapper around the configured master key.
#[derive(Clone)]
pub struct Vault {
    cipher: Aes256Gcm,
}

impl Vault {
    /// Build a vault from the configured master key string.
    ///
    /// The first 32 bytes of the key material are used; shorter keys are
    /// rejected with [`VaultError::InvalidKey`].
    pub fn new(master_key: &str) -> Result<Self, VaultError> {
        let bytes = master_key.as_bytes();
        if bytes.len() < KEY_LEN {
            return Err(VaultError::InvalidKey);
        }

        let key = Key::<Aes256Gcm>::from_slice(&bytes[..KEY_LEN]);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Encrypt a plaintext with a fresh random nonce.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        // The aead crate appends the tag to the ciphertext; the stored layout
        // is nonce || tag || ciphertext.
        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::AuthenticationFailed)?;
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        let mut combined = Vec::with_capacity(NONCE_LEN + TAG_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(tag);
        combined.extend_from_slice(ciphertext);

        Ok(BASE64.encode(combined))
    }

    /// Decrypt a stored blob. Never returns partially decrypted data.
    pub fn decrypt(&self, encoded: &str) -> Result<String, VaultError> {
        let combined = BASE64
            .decode(encoded)
            .map_err(|_| VaultError::AuthenticationFailed)?;

        if combined.len() < NONCE_LEN + TAG_LEN {
            return Err(VaultError::AuthenticationFailed);
        }

        let nonce = Nonce::from_slice(&combined[..NONCE_LEN]);
        let tag = &combined[NONCE_LEN..NONCE_LEN + TAG_LEN];
        let ciphertext = &combined[NONCE_LEN + TAG_LEN..];

        let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);

        let plaintext = self
            .cipher
            .decrypt(nonce, sealed.as_slice())
            .map_err(|_| VaultError::AuthenticationFailed)?;

        String::from_utf8(plaintext).map_err(|_| VaultError::AuthenticationFailed)
    }
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault").finish_non_exhaustive()
    }
}
