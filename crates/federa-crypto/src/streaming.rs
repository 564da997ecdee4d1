//! Chunked AEAD streams for client-side encryption
//!
//! Ciphertext layout: the plaintext is cut into `chunk_size` pieces and each
//! piece is sealed independently, so the stored object is
//! `plain + chunks * TAG_SIZE` bytes. The base nonce and cipher travel in
//! object metadata next to the plaintext length.

use crate::{
    error::IntegrityError,
    keys::DekKey,
    symmetric::{Aead, AeadCipher, Nonce},
    CryptoError, Result, DEFAULT_CHUNK_SIZE, TAG_SIZE,
};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

/// Metadata header holding the base64 base nonce
pub const META_IV: &str = "X-Amz-Meta-X-Amz-Iv";
/// Metadata header holding the cipher identifier
pub const META_CEK_ALG: &str = "X-Amz-Meta-X-Amz-Cek-Alg";
/// Metadata header holding the plaintext length
pub const META_UNENCRYPTED_LENGTH: &str = "X-Amz-Meta-X-Amz-Unencrypted-Content-Length";

/// Key material attached to a request targeting an encrypted data source
#[derive(Clone, Debug)]
pub struct EncryptionMaterial {
    key: DekKey,
    cipher: AeadCipher,
    nonce: Nonce,
    chunk_size: usize,
}

impl EncryptionMaterial {
    /// Fresh material for writing: random base nonce, default cipher
    pub fn new(key: DekKey) -> Self {
        Self {
            key,
            cipher: AeadCipher::default(),
            nonce: Nonce::generate(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Rebuild the material of a stored object from its metadata
    pub fn from_metadata<'a, I>(key: DekKey, metadata: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut nonce = None;
        let mut cipher = AeadCipher::default();
        for (name, value) in metadata {
            if name.eq_ignore_ascii_case(META_IV) {
                nonce = Some(Nonce::from_base64(value)?);
            } else if name.eq_ignore_ascii_case(META_CEK_ALG) {
                cipher = AeadCipher::from_algorithm_id(value).ok_or_else(|| {
                    CryptoError::Decryption(format!("unsupported cipher {}", value))
                })?;
            }
        }
        let nonce = nonce
            .ok_or_else(|| CryptoError::InvalidNonce(format!("missing {} metadata", META_IV)))?;
        Ok(Self {
            key,
            cipher,
            nonce,
            chunk_size: DEFAULT_CHUNK_SIZE,
        })
    }

    pub fn with_cipher(mut self, cipher: AeadCipher) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(CryptoError::InvalidChunkSize(chunk_size));
        }
        self.chunk_size = chunk_size;
        Ok(self)
    }

    pub fn key(&self) -> &DekKey {
        &self.key
    }

    pub fn cipher(&self) -> AeadCipher {
        self.cipher
    }

    pub fn nonce(&self) -> &Nonce {
        &self.nonce
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Stored size of a plaintext of `plain` bytes
    pub fn encrypted_size(&self, plain: u64) -> u64 {
        let chunk = self.chunk_size as u64;
        let chunks = plain.div_ceil(chunk);
        plain + chunks * TAG_SIZE as u64
    }

    /// Plaintext size of a stored object of `stored` bytes
    pub fn plain_size(&self, stored: u64) -> u64 {
        let sealed = (self.chunk_size + TAG_SIZE) as u64;
        let chunks = stored.div_ceil(sealed);
        stored.saturating_sub(chunks * TAG_SIZE as u64)
    }

    /// Metadata headers to store next to the ciphertext
    pub fn metadata(&self, plain_size: Option<u64>) -> Vec<(String, String)> {
        let mut headers = vec![
            (META_IV.to_string(), self.nonce.to_base64()),
            (META_CEK_ALG.to_string(), self.cipher.algorithm_id().to_string()),
        ];
        if let Some(size) = plain_size {
            headers.push((META_UNENCRYPTED_LENGTH.to_string(), size.to_string()));
        }
        headers
    }

    /// Wrap a plaintext reader into a ciphertext reader
    pub fn encrypt_reader<R: AsyncRead + Unpin>(&self, inner: R) -> EncryptReader<R> {
        EncryptReader(CipherReader::new(inner, self, Mode::Seal, None))
    }

    /// Wrap a ciphertext reader into a plaintext reader. When `plain_size` is
    /// known, a stream ending early fails with `IncompleteBody`.
    pub fn decrypt_reader<R: AsyncRead + Unpin>(
        &self,
        inner: R,
        plain_size: Option<u64>,
    ) -> DecryptReader<R> {
        DecryptReader(CipherReader::new(inner, self, Mode::Open, plain_size))
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Seal,
    Open,
}

struct CipherReader<R> {
    inner: R,
    aead: Aead,
    nonce: Nonce,
    mode: Mode,
    input_size: usize,
    input: Vec<u8>,
    output: Vec<u8>,
    output_pos: usize,
    index: u64,
    eof: bool,
    produced: u64,
    expected: Option<u64>,
    finished: bool,
}

impl<R: AsyncRead + Unpin> CipherReader<R> {
    fn new(inner: R, material: &EncryptionMaterial, mode: Mode, expected: Option<u64>) -> Self {
        let input_size = match mode {
            Mode::Seal => material.chunk_size,
            Mode::Open => material.chunk_size + TAG_SIZE,
        };
        Self {
            inner,
            aead: Aead::new(&material.key, material.cipher),
            nonce: material.nonce.clone(),
            mode,
            input_size,
            input: Vec::with_capacity(input_size),
            output: Vec::new(),
            output_pos: 0,
            index: 0,
            eof: false,
            produced: 0,
            expected,
            finished: false,
        }
    }

    fn transform(&mut self) -> io::Result<()> {
        let chunk = std::mem::take(&mut self.input);
        let out = match self.mode {
            Mode::Seal => self
                .aead
                .seal_chunk(&self.nonce, self.index, &chunk)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?,
            Mode::Open => self
                .aead
                .open_chunk(&self.nonce, self.index, &chunk)
                .map_err(|_| IntegrityError::ChunkAuthentication { index: self.index }.into_io())?,
        };
        self.index += 1;
        self.produced += out.len() as u64;
        self.output = out;
        self.output_pos = 0;
        self.input = Vec::with_capacity(self.input_size);
        Ok(())
    }

    fn poll_fill(&mut self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        loop {
            if self.output_pos < self.output.len() {
                let n = buf.remaining().min(self.output.len() - self.output_pos);
                buf.put_slice(&self.output[self.output_pos..self.output_pos + n]);
                self.output_pos += n;
                return Poll::Ready(Ok(()));
            }

            if self.eof && self.input.is_empty() {
                if !self.finished {
                    self.finished = true;
                    if let Some(expected) = self.expected {
                        if self.produced < expected {
                            return Poll::Ready(Err(IntegrityError::IncompleteBody {
                                expected,
                                actual: self.produced,
                            }
                            .into_io()));
                        }
                    }
                }
                return Poll::Ready(Ok(()));
            }

            while !self.eof && self.input.len() < self.input_size {
                let mut scratch = [0u8; 8192];
                let want = scratch.len().min(self.input_size - self.input.len());
                let mut read_buf = ReadBuf::new(&mut scratch[..want]);
                ready!(Pin::new(&mut self.inner).poll_read(cx, &mut read_buf))?;
                if read_buf.filled().is_empty() {
                    self.eof = true;
                } else {
                    self.input.extend_from_slice(read_buf.filled());
                }
            }

            if !self.input.is_empty() {
                self.transform()?;
            }
        }
    }
}

/// Plaintext in, ciphertext out
pub struct EncryptReader<R>(CipherReader<R>);

/// Ciphertext in, plaintext out
pub struct DecryptReader<R>(CipherReader<R>);

impl<R: AsyncRead + Unpin> AsyncRead for EncryptReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.get_mut().0.poll_fill(cx, buf)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for DecryptReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.get_mut().0.poll_fill(cx, buf)
    }
}
