//! Error types for the federa-crypto crate

use thiserror::Error;

/// Result type alias using `CryptoError`
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Errors that can occur during cryptographic operations
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Encryption failed
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption failed
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Invalid key format or length
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Invalid nonce
    #[error("invalid nonce: {0}")]
    InvalidNonce(String),

    /// Invalid digest encoding
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// Invalid chunk size
    #[error("invalid chunk size: {0}")]
    InvalidChunkSize(usize),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Base64 decode error
    #[error("base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    /// Hex decode error
    #[error("hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),
}

/// Integrity failures detected while a body is being streamed.
///
/// These travel inside `std::io::Error` (kind `InvalidData`) because they are
/// raised from `AsyncRead` implementations; use [`find_integrity_error`] to
/// recover them on the other side of a backend call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("content MD5 mismatch: expected {expected}, computed {actual}")]
    BadDigest { expected: String, actual: String },

    #[error("content SHA-256 mismatch: expected {expected}, computed {actual}")]
    Sha256Mismatch { expected: String, actual: String },

    #[error("incomplete body: expected {expected} bytes, read {actual}")]
    IncompleteBody { expected: u64, actual: u64 },

    #[error("encrypted chunk {index} failed authentication")]
    ChunkAuthentication { index: u64 },
}

impl IntegrityError {
    /// Wrap into an io::Error suitable for returning from `poll_read`
    pub fn into_io(self) -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::InvalidData, self)
    }
}

/// Walk an error's source chain looking for an [`IntegrityError`].
pub fn find_integrity_error<'a>(
    err: &'a (dyn std::error::Error + 'static),
) -> Option<&'a IntegrityError> {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(found) = e.downcast_ref::<IntegrityError>() {
            return Some(found);
        }
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if let Some(found) = io.get_ref().and_then(|inner| inner.downcast_ref::<IntegrityError>()) {
                return Some(found);
            }
        }
        current = e.source();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_integrity_error_in_io() {
        let err = IntegrityError::IncompleteBody { expected: 10, actual: 3 }.into_io();
        let found = find_integrity_error(&err).unwrap();
        assert_eq!(found, &IntegrityError::IncompleteBody { expected: 10, actual: 3 });
    }

    #[test]
    fn test_find_integrity_error_through_crypto_error() {
        let io = IntegrityError::BadDigest {
            expected: "aa".into(),
            actual: "bb".into(),
        }
        .into_io();
        let err = CryptoError::from(io);
        assert!(matches!(
            find_integrity_error(&err),
            Some(IntegrityError::BadDigest { .. })
        ));
    }

    #[test]
    fn test_plain_io_error_is_not_integrity() {
        let err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed");
        assert!(find_integrity_error(&err).is_none());
    }
}
