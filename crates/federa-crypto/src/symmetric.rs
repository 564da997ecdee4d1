//! Symmetric encryption using AES-GCM and ChaCha20-Poly1305
//!
//! Objects on encrypted data sources are sealed chunk by chunk. Each chunk
//! uses the object's base nonce offset by the chunk index, and the index is
//! bound as associated data so chunks cannot be reordered.

use crate::{
    keys::{DekKey, KEY_SIZE, NONCE_SIZE},
    CryptoError, Result,
};
use aes_gcm::{
    aead::{Aead as AeadTrait, Payload},
    Aes256Gcm, KeyInit,
};
use base64::Engine;
use chacha20poly1305::ChaCha20Poly1305;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// A nonce for AEAD encryption
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nonce {
    bytes: [u8; NONCE_SIZE],
}

impl Nonce {
    /// Generate a random nonce
    pub fn generate() -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        rand::RngCore::fill_bytes(&mut OsRng, &mut bytes);
        Self { bytes }
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != NONCE_SIZE {
            return Err(CryptoError::InvalidNonce(format!(
                "nonce must be {} bytes, got {}",
                NONCE_SIZE,
                bytes.len()
            )));
        }
        let mut arr = [0u8; NONCE_SIZE];
        arr.copy_from_slice(bytes);
        Ok(Self { bytes: arr })
    }

    /// Decode from the base64 form stored in object metadata
    pub fn from_base64(s: &str) -> Result<Self> {
        let bytes = base64::engine::general_purpose::STANDARD.decode(s.trim())?;
        Self::from_bytes(&bytes)
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.bytes)
    }

    /// Get the nonce bytes
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.bytes
    }

    /// Nonce for chunk `index`: the base nonce plus `index` as a big-endian
    /// counter over the trailing eight bytes.
    pub fn for_chunk(&self, index: u64) -> Self {
        let mut bytes = self.bytes;
        let mut tail = [0u8; 8];
        tail.copy_from_slice(&bytes[NONCE_SIZE - 8..]);
        let counter = u64::from_be_bytes(tail).wrapping_add(index);
        bytes[NONCE_SIZE - 8..].copy_from_slice(&counter.to_be_bytes());
        Self { bytes }
    }
}

/// Supported AEAD ciphers
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AeadCipher {
    /// AES-256-GCM
    #[default]
    Aes256Gcm,
    /// ChaCha20-Poly1305
    ChaCha20Poly1305,
}

impl AeadCipher {
    /// Get the algorithm identifier string
    pub fn algorithm_id(&self) -> &'static str {
        match self {
            Self::Aes256Gcm => "AES-256-GCM",
            Self::ChaCha20Poly1305 => "ChaCha20-Poly1305",
        }
    }

    /// Parse the identifier written in object metadata
    pub fn from_algorithm_id(id: &str) -> Option<Self> {
        match id {
            "AES-256-GCM" => Some(Self::Aes256Gcm),
            "ChaCha20-Poly1305" => Some(Self::ChaCha20Poly1305),
            _ => None,
        }
    }
}

/// AEAD encryption/decryption interface
pub struct Aead {
    cipher: AeadCipher,
    key: [u8; KEY_SIZE],
}

impl Aead {
    /// Create a new AEAD instance with the given key and cipher
    pub fn new(key: &DekKey, cipher: AeadCipher) -> Self {
        Self {
            cipher,
            key: *key.as_bytes(),
        }
    }

    pub fn cipher(&self) -> AeadCipher {
        self.cipher
    }

    /// Encrypt data with the given nonce and associated data
    pub fn encrypt_with_aad(&self, nonce: &Nonce, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let payload = Payload { msg: plaintext, aad };
        match self.cipher {
            AeadCipher::Aes256Gcm => Aes256Gcm::new_from_slice(&self.key)
                .map_err(|e| CryptoError::Encryption(e.to_string()))?
                .encrypt(aes_gcm::Nonce::from_slice(nonce.as_bytes()), payload)
                .map_err(|e| CryptoError::Encryption(e.to_string())),
            AeadCipher::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(&self.key)
                .map_err(|e| CryptoError::Encryption(e.to_string()))?
                .encrypt(chacha20poly1305::Nonce::from_slice(nonce.as_bytes()), payload)
                .map_err(|e| CryptoError::Encryption(e.to_string())),
        }
    }

    /// Decrypt data with the given nonce and associated data
    pub fn decrypt_with_aad(&self, nonce: &Nonce, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let payload = Payload { msg: ciphertext, aad };
        match self.cipher {
            AeadCipher::Aes256Gcm => Aes256Gcm::new_from_slice(&self.key)
                .map_err(|e| CryptoError::Decryption(e.to_string()))?
                .decrypt(aes_gcm::Nonce::from_slice(nonce.as_bytes()), payload)
                .map_err(|e| CryptoError::Decryption(e.to_string())),
            AeadCipher::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(&self.key)
                .map_err(|e| CryptoError::Decryption(e.to_string()))?
                .decrypt(chacha20poly1305::Nonce::from_slice(nonce.as_bytes()), payload)
                .map_err(|e| CryptoError::Decryption(e.to_string())),
        }
    }

    /// Seal one chunk of a stream
    pub fn seal_chunk(&self, base: &Nonce, index: u64, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.encrypt_with_aad(&base.for_chunk(index), plaintext, &index.to_be_bytes())
    }

    /// Open one chunk of a stream
    pub fn open_chunk(&self, base: &Nonce, index: u64, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.decrypt_with_aad(&base.for_chunk(index), ciphertext, &index.to_be_bytes())
    }
}

impl Drop for Aead {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_for_chunk_carries() {
        let mut raw = [0u8; NONCE_SIZE];
        raw[NONCE_SIZE - 1] = 0xff;
        let base = Nonce::from_bytes(&raw).unwrap();
        let next = base.for_chunk(1);
        assert_eq!(next.as_bytes()[NONCE_SIZE - 1], 0);
        assert_eq!(next.as_bytes()[NONCE_SIZE - 2], 1);
        assert_eq!(base.for_chunk(0), base);
    }

    #[test]
    fn test_chunk_roundtrip_both_ciphers() {
        for cipher in [AeadCipher::Aes256Gcm, AeadCipher::ChaCha20Poly1305] {
            let key = DekKey::generate();
            let aead = Aead::new(&key, cipher);
            let base = Nonce::generate();
            let sealed = aead.seal_chunk(&base, 3, b"chunk body").unwrap();
            assert_eq!(sealed.len(), b"chunk body".len() + crate::TAG_SIZE);
            assert_eq!(aead.open_chunk(&base, 3, &sealed).unwrap(), b"chunk body");
        }
    }

    #[test]
    fn test_reordered_chunk_fails() {
        let aead = Aead::new(&DekKey::generate(), AeadCipher::default());
        let base = Nonce::generate();
        let sealed = aead.seal_chunk(&base, 0, b"first").unwrap();
        assert!(aead.open_chunk(&base, 1, &sealed).is_err());
    }

    #[test]
    fn test_algorithm_id_roundtrip() {
        for cipher in [AeadCipher::Aes256Gcm, AeadCipher::ChaCha20Poly1305] {
            assert_eq!(AeadCipher::from_algorithm_id(cipher.algorithm_id()), Some(cipher));
        }
        assert_eq!(AeadCipher::from_algorithm_id("AES-CBC"), None);
    }
}
