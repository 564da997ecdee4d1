//! Content digests for S3 payloads
//!
//! ETags are the hex MD5 of the stored bytes; `x-amz-content-sha256` is the
//! hex SHA-256. [`HashingReader`] computes both while a body streams through
//! it and fails the read at end-of-stream when they disagree with what the
//! client declared.

use crate::{error::IntegrityError, CryptoError, Result};
use base64::Engine;
use md5::{Digest, Md5};
use sha2::Sha256;
use parking_lot::Mutex;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

/// Calculate the hex MD5 of a buffer (S3 ETag for single-part objects)
pub fn md5_hash(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Calculate the hex SHA-256 of a buffer
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Normalize a client-supplied MD5 to lowercase hex.
///
/// Accepts both the hex form and the base64 form used by `Content-MD5`.
pub fn normalize_md5(value: &str) -> Result<String> {
    let trimmed = value.trim().trim_matches('"');
    if trimmed.len() == 32 && trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        return Ok(trimmed.to_ascii_lowercase());
    }
    let raw = base64::engine::general_purpose::STANDARD.decode(trimmed)?;
    if raw.len() != 16 {
        return Err(CryptoError::InvalidDigest(format!(
            "MD5 must be 16 bytes, got {}",
            raw.len()
        )));
    }
    Ok(hex::encode(raw))
}

/// Calculate an MD5 hash incrementally
pub struct Md5Hasher {
    hasher: Md5,
    bytes_processed: u64,
}

impl Md5Hasher {
    pub fn new() -> Self {
        Self {
            hasher: Md5::new(),
            bytes_processed: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes_processed += data.len() as u64;
    }

    pub fn finalize(self) -> String {
        hex::encode(self.hasher.finalize())
    }

    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed
    }
}

impl Default for Md5Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared view of a [`HashingReader`]'s verification outcome.
///
/// Backends may flatten the reader's io error into their own error types;
/// the probe keeps the original failure reachable for the caller.
#[derive(Clone, Default)]
pub struct IntegrityProbe(Arc<Mutex<Option<IntegrityError>>>);

impl IntegrityProbe {
    /// The integrity failure raised at end-of-stream, if any
    pub fn failure(&self) -> Option<IntegrityError> {
        self.0.lock().clone()
    }

    fn record(&self, err: &IntegrityError) {
        *self.0.lock() = Some(err.clone());
    }
}

/// `AsyncRead` adapter that hashes everything read through it and verifies
/// the declared digests and size once the inner reader reports EOF.
pub struct HashingReader<R> {
    inner: R,
    md5: Md5,
    sha256: Sha256,
    read: u64,
    expected_md5: Option<String>,
    expected_sha256: Option<String>,
    expected_size: Option<u64>,
    verified: bool,
    probe: IntegrityProbe,
}

impl<R: AsyncRead + Unpin> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            md5: Md5::new(),
            sha256: Sha256::new(),
            read: 0,
            expected_md5: None,
            expected_sha256: None,
            expected_size: None,
            verified: false,
            probe: IntegrityProbe::default(),
        }
    }

    /// Expect a hex MD5 digest (see [`normalize_md5`])
    pub fn with_md5(mut self, md5_hex: Option<String>) -> Self {
        self.expected_md5 = md5_hex.filter(|s| !s.is_empty());
        self
    }

    /// Expect a hex SHA-256 digest
    pub fn with_sha256(mut self, sha256_hex: Option<String>) -> Self {
        self.expected_sha256 = sha256_hex
            .filter(|s| !s.is_empty() && s != "UNSIGNED-PAYLOAD")
            .map(|s| s.to_ascii_lowercase());
        self
    }

    /// Expect at least `size` bytes; a negative or absent size disables the check
    pub fn with_size(mut self, size: Option<u64>) -> Self {
        self.expected_size = size;
        self
    }

    /// Handle observing the verification outcome after the reader is moved
    pub fn probe(&self) -> IntegrityProbe {
        self.probe.clone()
    }

    /// Bytes read so far
    pub fn bytes_read(&self) -> u64 {
        self.read
    }

    /// Hex MD5 of everything read so far
    pub fn md5_hex(&self) -> String {
        hex::encode(self.md5.clone().finalize())
    }

    /// Hex SHA-256 of everything read so far
    pub fn sha256_hex(&self) -> String {
        hex::encode(self.sha256.clone().finalize())
    }

    fn verify(&self) -> std::result::Result<(), IntegrityError> {
        if let Some(expected) = self.expected_size {
            if self.read < expected {
                return Err(IntegrityError::IncompleteBody {
                    expected,
                    actual: self.read,
                });
            }
        }
        if let Some(expected) = &self.expected_md5 {
            let actual = self.md5_hex();
            if &actual != expected {
                return Err(IntegrityError::BadDigest {
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        if let Some(expected) = &self.expected_sha256 {
            let actual = self.sha256_hex();
            if &actual != expected {
                return Err(IntegrityError::Sha256Mismatch {
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(())
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HashingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let fresh = &buf.filled()[before..];

        if fresh.is_empty() {
            if !this.verified {
                this.verified = true;
                if let Err(err) = this.verify() {
                    this.probe.record(&err);
                    return Poll::Ready(Err(err.into_io()));
                }
            }
            return Poll::Ready(Ok(()));
        }

        this.md5.update(fresh);
        this.sha256.update(fresh);
        this.read += fresh.len() as u64;
        Poll::Ready(Ok(()))
    }
}
