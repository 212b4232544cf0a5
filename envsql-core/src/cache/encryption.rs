//! At-rest encryption for file-backed cache values.
//!
//! The passphrase from `ENVSQL_CACHE_KEY` is hashed with SHA-256 into an
//! AES-256-GCM key. Every write uses a fresh random 96-bit nonce; the stored
//! blob is `base64(nonce ‖ auth_tag ‖ ciphertext)`. Decryption failure (wrong
//! key, corruption, or a value written without encryption) degrades to
//! returning the raw blob so higher layers can treat it as a stale entry.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use sha2::{Digest, Sha256};
use tracing::warn;
use zeroize::Zeroizing;

use crate::error::{EnvSqlError, Result};

/// Environment variable holding the cache encryption passphrase.
pub const ENV_CACHE_KEY: &str = "ENVSQL_CACHE_KEY";

const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

/// Symmetric cipher for cache values, keyed from a passphrase.
pub struct CacheCipher {
    key: Zeroizing<[u8; 32]>,
}

impl std::fmt::Debug for CacheCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheCipher").finish_non_exhaustive()
    }
}

impl CacheCipher {
    /// Builds a cipher from the `ENVSQL_CACHE_KEY` environment variable, if
    /// set and non-empty.
    pub fn from_env() -> Option<Self> {
        match std::env::var(ENV_CACHE_KEY) {
            Ok(passphrase) if !passphrase.is_empty() => Some(Self::new(&passphrase)),
            _ => None,
        }
    }

    /// Derives the AES-256 key by hashing the passphrase with SHA-256.
    pub fn new(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&digest);
        Self { key }
    }

    /// Encrypts a value with a fresh random nonce. The same plaintext
    /// encrypts to a different blob every time.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&*self.key));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        // aes-gcm appends the 16-byte auth tag to the ciphertext
        let sealed = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| EnvSqlError::cache_unavailable(format!("encryption failed: {e}")))?;
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_SIZE);

        let mut combined = Vec::with_capacity(NONCE_SIZE + TAG_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(tag);
        combined.extend_from_slice(ciphertext);
        Ok(BASE64.encode(combined))
    }

    /// Decrypts a stored blob, returning the blob unchanged when it cannot
    /// be decrypted.
    pub fn decrypt(&self, blob: &str) -> String {
        match self.try_decrypt(blob) {
            Some(plaintext) => plaintext,
            None => {
                warn!("cache value decryption failed, returning stored value as-is");
                blob.to_string()
            }
        }
    }

    fn try_decrypt(&self, blob: &str) -> Option<String> {
        let combined = BASE64.decode(blob).ok()?;
        if combined.len() < NONCE_SIZE + TAG_SIZE {
            return None;
        }
        let (nonce, rest) = combined.split_at(NONCE_SIZE);
        let (tag, ciphertext) = rest.split_at(TAG_SIZE);

        // aes-gcm expects ciphertext ‖ tag
        let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_SIZE);
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&*self.key));
        let nonce = Nonce::from_slice(nonce);
        let plaintext = cipher.decrypt(nonce, sealed.as_slice()).ok()?;
        String::from_utf8(plaintext).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let cipher = CacheCipher::new("correct horse battery staple");
        let url = "postgres://user:pw@postgres-main.internal/app";

        let blob = cipher.encrypt(url).unwrap();
        assert_ne!(blob, url);
        assert_eq!(cipher.decrypt(&blob), url);
    }

    #[test]
    fn fresh_nonce_per_write() {
        let cipher = CacheCipher::new("passphrase");
        let value = "same value";

        let blob1 = cipher.encrypt(value).unwrap();
        let blob2 = cipher.encrypt(value).unwrap();
        assert_ne!(blob1, blob2);
        assert_eq!(cipher.decrypt(&blob1), value);
        assert_eq!(cipher.decrypt(&blob2), value);
    }

    #[test]
    fn wrong_key_returns_blob_unchanged() {
        let cipher = CacheCipher::new("key one");
        let other = CacheCipher::new("key two");

        let blob = cipher.encrypt("secret").unwrap();
        assert_eq!(other.decrypt(&blob), blob);
    }

    #[test]
    fn non_encrypted_value_passes_through() {
        let cipher = CacheCipher::new("key");
        assert_eq!(
            cipher.decrypt("postgres://plain@host/db"),
            "postgres://plain@host/db"
        );
    }

    #[test]
    fn truncated_blob_passes_through() {
        let cipher = CacheCipher::new("key");
        let short = BASE64.encode([0u8; 8]);
        assert_eq!(cipher.decrypt(&short), short);
    }
}
