//! # Federa Crypto
//!
//! Hashing and client-side encryption primitives used by the gateway.
//!
//! This crate provides:
//! - **Content digests**: MD5 ETags and SHA-256 payload hashes, plus a
//!   verifying reader that checks a streamed body against client-supplied
//!   digests and a declared size
//! - **Data keys**: 256-bit symmetric keys handed out by the key service
//! - **Chunked AEAD streams**: encrypting and decrypting `AsyncRead` adapters
//!   used for data sources flagged as encrypted
//!
//! ## Example
//!
//! ```rust,ignore
//! use federa_crypto::{DekKey, EncryptionMaterial};
//!
//! let material = EncryptionMaterial::new(DekKey::generate());
//! let sealed = material.encrypt_reader(plain_reader);
//! let opened = material.decrypt_reader(sealed, Some(plain_len));
//! ```

pub mod error;
pub mod hashing;
pub mod keys;
pub mod streaming;
pub mod symmetric;

pub use error::{find_integrity_error, CryptoError, IntegrityError, Result};
pub use hashing::{md5_hash, normalize_md5, sha256_hex, HashingReader, IntegrityProbe, Md5Hasher};
pub use keys::{DekKey, KEY_SIZE, NONCE_SIZE};
pub use streaming::{DecryptReader, EncryptReader, EncryptionMaterial};
pub use symmetric::{Aead, AeadCipher, Nonce};

/// Default plaintext chunk size for streaming encryption (64 KB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Size of the authentication tag appended to every sealed chunk
pub const TAG_SIZE: usize = 16;
