//! # Federa Objects
//!
//! Object backends behind the gateway's data sources.
//!
//! This crate provides:
//! - **ObjectBackend**: the S3 operation surface the executor speaks
//!   (range GET, streaming PUT, server-side copy, prefix listing and the
//!   multipart family)
//! - **MemoryObjectStore**: an in-memory backend with change observers, for
//!   development runs and tests
//! - **S3HttpClient**: a path-style S3 client over `reqwest`
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Executor / Clients pool          │
//! ├─────────────────────────────────────────┤
//! │          ObjectBackend Trait            │
//! ├────────────────────┬────────────────────┤
//! │  MemoryObjectStore │    S3HttpClient    │
//! └────────────────────┴────────────────────┘
//! ```

pub mod error;
pub mod memory;
pub mod s3;
pub mod types;
pub mod xml;

pub use error::{ObjectStoreError, Result};
pub use memory::{MemoryObjectStore, ObjectObserver};
pub use s3::{S3BackendConfig, S3HttpClient};
pub use types::{
    meta_get, ByteRange, CompletePart, GetOptions, ListObjectsResult, Metadata, MultipartUploadInfo,
    ObjectEvent, ObjectInfo, PartInfo, PutOptions,
};

use async_trait::async_trait;
use std::pin::Pin;
use tokio::io::AsyncRead;

/// Streaming object body
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

/// Trait for object storage backends
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Backend identifier, used in logs
    fn name(&self) -> &str;

    /// Open an object for reading, optionally restricted to a byte range
    async fn get_object(&self, bucket: &str, key: &str, opts: GetOptions) -> Result<ObjectReader>;

    /// Stat an object
    async fn stat_object(&self, bucket: &str, key: &str) -> Result<ObjectInfo>;

    /// Store an object from a stream. `size` is the declared length when known.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        reader: ObjectReader,
        size: Option<u64>,
        opts: PutOptions,
    ) -> Result<ObjectInfo>;

    /// Server-side copy. `metadata = Some(..)` replaces the source metadata.
    async fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
        metadata: Option<Metadata>,
    ) -> Result<ObjectInfo>;

    /// Remove an object; removing a missing object succeeds
    async fn remove_object(&self, bucket: &str, key: &str) -> Result<()>;

    /// List objects under a prefix; non-recursive listings fold deeper keys
    /// into common prefixes on `/`
    async fn list_objects(&self, bucket: &str, prefix: &str, recursive: bool)
        -> Result<ListObjectsResult>;

    async fn new_multipart_upload(&self, bucket: &str, key: &str, opts: PutOptions) -> Result<String>;

    async fn list_multipart_uploads(&self, bucket: &str, prefix: &str)
        -> Result<Vec<MultipartUploadInfo>>;

    async fn list_object_parts(&self, bucket: &str, key: &str, upload_id: &str)
        -> Result<Vec<PartInfo>>;

    #[allow(clippy::too_many_arguments)]
    async fn put_object_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        reader: ObjectReader,
        size: Option<u64>,
        opts: PutOptions,
    ) -> Result<PartInfo>;

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletePart>,
    ) -> Result<ObjectInfo>;

    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()>;
}

/// S3 ETag of a completed multipart upload: MD5 over the concatenated part
/// digests, suffixed with the part count.
pub fn multipart_etag(part_etags: &[String]) -> String {
    let mut raw = Vec::with_capacity(part_etags.len() * 16);
    for etag in part_etags {
        if let Ok(bytes) = hex::decode(etag.trim_matches('"')) {
            raw.extend_from_slice(&bytes);
        }
    }
    format!("{}-{}", federa_crypto::md5_hash(&raw), part_etags.len())
}
