//! AES-256-GCM value sealing for the persistent engine.
//!
//! Sealed layout: 12-byte nonce followed by ciphertext with its 16-byte tag.

use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{KrknError, Result};

/// Required length of a store encryption key.
pub const KEY_LEN: usize = 32;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// 256-bit (32-byte) store encryption key
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    /// Validate and copy a caller-supplied key. Anything but 32 bytes is a config error.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            KrknError::Config(format!(
                "encryption key must be {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(raw))
    }

    fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// One-way digest identifying the key without revealing it.
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"krkn-key-fingerprint");
        hasher.update(self.0);
        hasher.finalize().into()
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptionKey([REDACTED])")
    }
}

/// Seals and opens engine values under one key.
pub struct ValueCipher {
    cipher: Aes256Gcm,
}

impl ValueCipher {
    /// Build a cipher for `key`.
    pub fn new(key: &EncryptionKey) -> Result<Self> {
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| KrknError::Encryption(e.to_string()))?;
        Ok(Self { cipher })
    }

    /// Encrypt `plaintext` under a fresh random nonce.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        use rand::RngCore;
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(aes_gcm::Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| KrknError::Encryption(e.to_string()))?;
        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt a value produced by [`seal`](Self::seal).
    ///
    /// Fails when the value is truncated, tampered with, or sealed under another key.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(KrknError::Corrupt(format!(
                "sealed value too short: {} bytes",
                sealed.len()
            )));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(aes_gcm::Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                KrknError::Encryption("authentication tag mismatch (wrong key or corrupted data)".into())
            })
    }
}

impl std::fmt::Debug for ValueCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueCipher").finish_non_exhaustive()
    }
}
