//! Value types exchanged with object backends

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// User metadata attached to an object, keyed by full header name
/// (`X-Amz-Meta-*`). Lookups are case-insensitive, see [`meta_get`].
pub type Metadata = BTreeMap<String, String>;

/// Case-insensitive metadata lookup
pub fn meta_get<'a>(metadata: &'a Metadata, name: &str) -> Option<&'a str> {
    metadata
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Inclusive byte range; `end = None` reads to the end of the object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    /// Range covering `length` bytes from `offset`; a non-positive length
    /// means "to the end".
    pub fn from_offset(offset: u64, length: i64) -> Self {
        let end = if length > 0 {
            Some(offset + length as u64 - 1)
        } else {
            None
        };
        Self { start: offset, end }
    }

    /// Value for the HTTP `Range` header
    pub fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }
}

/// Options for a GET
#[derive(Clone, Debug, Default)]
pub struct GetOptions {
    pub range: Option<ByteRange>,
    pub version_id: Option<String>,
}

/// Options for a PUT or a part upload
#[derive(Clone, Debug, Default)]
pub struct PutOptions {
    /// Client-supplied MD5, hex
    pub md5: Option<String>,
    /// Client-supplied SHA-256, hex
    pub sha256: Option<String>,
    pub content_type: Option<String>,
    pub metadata: Metadata,
}

/// Object information as returned by stat, put and list
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
    pub content_type: Option<String>,
    pub metadata: Metadata,
}

impl ObjectInfo {
    pub fn new(key: impl Into<String>, size: u64, etag: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            size,
            etag: etag.into(),
            last_modified: Utc::now(),
            content_type: None,
            metadata: Metadata::new(),
        }
    }

    pub fn is_dir_marker(&self) -> bool {
        self.key.ends_with('/')
    }
}

/// Result of a prefix listing
#[derive(Clone, Debug, Default)]
pub struct ListObjectsResult {
    pub objects: Vec<ObjectInfo>,
    pub common_prefixes: Vec<String>,
}

/// An in-flight multipart upload
#[derive(Clone, Debug, PartialEq)]
pub struct MultipartUploadInfo {
    pub key: String,
    pub upload_id: String,
    pub initiated: DateTime<Utc>,
}

/// A part of a multipart upload
#[derive(Clone, Debug, PartialEq)]
pub struct PartInfo {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// A part reference in a completion request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletePart {
    pub part_number: u32,
    pub etag: String,
}

/// Change notification emitted by backends that support observers
#[derive(Clone, Debug)]
pub enum ObjectEvent {
    Put { bucket: String, info: ObjectInfo },
    Removed { bucket: String, key: String },
}
