//! Error types for the federa-core crate
//!
//! Every error classifies into an [`ErrorKind`] and maps to a stable
//! [`S3ErrorCode`] so the wire layer can render it without knowing which
//! component raised it.

use federa_crypto::{find_integrity_error, CryptoError, IntegrityError};
use federa_objects::ObjectStoreError;
use thiserror::Error;

/// Result type alias using `CoreError`
pub type Result<T> = std::result::Result<T, CoreError>;

/// Error taxonomy shared by all components
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Forbidden,
    InvalidRequest,
    IntegrityFailure,
    QuotaOrCapacity,
    Conflict,
    Transient,
    NotImplemented,
    Internal,
}

/// S3 error codes surfaced to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S3ErrorCode {
    AccessDenied,
    BadDigest,
    IncompleteBody,
    InternalError,
    InvalidArgument,
    InvalidPart,
    InvalidRange,
    InvalidRequest,
    MalformedXML,
    NoSuchBucket,
    NoSuchKey,
    NoSuchUpload,
    NotImplemented,
    OperationAborted,
    RequestTimeout,
    ServiceUnavailable,
    StorageFull,
    XAmzContentSHA256Mismatch,
}

impl S3ErrorCode {
    /// Get the error code string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AccessDenied => "AccessDenied",
            Self::BadDigest => "BadDigest",
            Self::IncompleteBody => "IncompleteBody",
            Self::InternalError => "InternalError",
            Self::InvalidArgument => "InvalidArgument",
            Self::InvalidPart => "InvalidPart",
            Self::InvalidRange => "InvalidRange",
            Self::InvalidRequest => "InvalidRequest",
            Self::MalformedXML => "MalformedXML",
            Self::NoSuchBucket => "NoSuchBucket",
            Self::NoSuchKey => "NoSuchKey",
            Self::NoSuchUpload => "NoSuchUpload",
            Self::NotImplemented => "NotImplemented",
            Self::OperationAborted => "OperationAborted",
            Self::RequestTimeout => "RequestTimeout",
            Self::ServiceUnavailable => "ServiceUnavailable",
            Self::StorageFull => "StorageFull",
            Self::XAmzContentSHA256Mismatch => "XAmzContentSHA256Mismatch",
        }
    }

    /// HTTP status for the code
    pub fn status_code(&self) -> u16 {
        match self {
            Self::AccessDenied => 403,
            Self::BadDigest
            | Self::IncompleteBody
            | Self::InvalidArgument
            | Self::InvalidPart
            | Self::InvalidRequest
            | Self::MalformedXML
            | Self::RequestTimeout
            | Self::XAmzContentSHA256Mismatch => 400,
            Self::NoSuchBucket | Self::NoSuchKey | Self::NoSuchUpload => 404,
            Self::OperationAborted => 409,
            Self::InvalidRange => 416,
            Self::InternalError => 500,
            Self::NotImplemented => 501,
            Self::ServiceUnavailable | Self::StorageFull => 503,
        }
    }
}

/// Errors raised by the gateway core
#[derive(Error, Debug)]
pub enum CoreError {
    /// Node not found in the index
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// Object not found on a data source
    #[error("object not found: {bucket}/{key}")]
    ObjectNotFound { bucket: String, key: String },

    /// Bucket not found on a data source
    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    #[error("workspace not found: {0}")]
    WorkspaceNotFound(String),

    #[error("data source not found: {0}")]
    DataSourceNotFound(String),

    #[error("archive member not found: {0}")]
    ArchiveMemberNotFound(String),

    #[error("multipart upload not found: {0}")]
    UploadNotFound(String),

    /// Access denied
    #[error("access denied: {0}")]
    Forbidden(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("malformed XML: {0}")]
    MalformedXml(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Requested range cannot be satisfied
    #[error("invalid range on {bucket}/{key}")]
    InvalidRange { bucket: String, key: String },

    /// Digest or length mismatch detected while streaming
    #[error(transparent)]
    Integrity(IntegrityError),

    #[error("storage full: {0}")]
    StorageFull(String),

    /// Conflicting state, e.g. an object where a collection is expected
    #[error("conflict: {0}")]
    Conflict(String),

    /// A collaborator is temporarily unavailable
    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Backend failure tagged with the bucket and object it concerned
    #[error("backend error on {bucket}/{key}: {source}")]
    Backend {
        bucket: String,
        key: String,
        #[source]
        source: ObjectStoreError,
    },

    /// Crypto error
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("request cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Wrap a backend error with the `{bucket, object}` it concerned,
    /// lifting not-found, range and integrity failures into their own variants.
    pub fn backend(bucket: &str, key: &str, err: ObjectStoreError) -> Self {
        match err {
            ObjectStoreError::NoSuchKey { .. } => Self::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            },
            ObjectStoreError::NoSuchBucket(b) => Self::BucketNotFound(b),
            ObjectStoreError::NoSuchUpload(id) => Self::UploadNotFound(id),
            ObjectStoreError::InvalidRange { .. } => Self::InvalidRange {
                bucket: bucket.to_string(),
                key: key.to_string(),
            },
            ObjectStoreError::AccessDenied(msg) => Self::Forbidden(msg),
            other => match find_integrity_error(&other) {
                Some(integrity) => Self::Integrity(integrity.clone()),
                None => Self::Backend {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    source: other,
                },
            },
        }
    }

    /// Classify into the error taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NodeNotFound(_)
            | Self::ObjectNotFound { .. }
            | Self::BucketNotFound(_)
            | Self::WorkspaceNotFound(_)
            | Self::DataSourceNotFound(_)
            | Self::ArchiveMemberNotFound(_)
            | Self::UploadNotFound(_) => ErrorKind::NotFound,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::InvalidArgument(_)
            | Self::MalformedXml(_)
            | Self::InvalidRequest(_)
            | Self::InvalidRange { .. }
            | Self::Cancelled => ErrorKind::InvalidRequest,
            Self::Integrity(_) => ErrorKind::IntegrityFailure,
            Self::StorageFull(_) => ErrorKind::QuotaOrCapacity,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Unavailable(_) => ErrorKind::Transient,
            Self::NotImplemented(_) => ErrorKind::NotImplemented,
            Self::Backend { source, .. } => match source {
                ObjectStoreError::InvalidPart { .. } => ErrorKind::InvalidRequest,
                ObjectStoreError::Connection(_) | ObjectStoreError::Timeout => ErrorKind::Transient,
                ObjectStoreError::S3 { status: 503, .. } => ErrorKind::Transient,
                ObjectStoreError::S3 { status: 501, .. } => ErrorKind::NotImplemented,
                _ => ErrorKind::Internal,
            },
            Self::Crypto(_) | Self::Internal(_) => ErrorKind::Internal,
            Self::Io(err) => match find_integrity_error(err) {
                Some(_) => ErrorKind::IntegrityFailure,
                None => ErrorKind::Internal,
            },
        }
    }

    /// Check if this is a "not found" error
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Map to the S3 error code sent to clients
    pub fn s3_code(&self) -> S3ErrorCode {
        match self {
            Self::ObjectNotFound { .. }
            | Self::NodeNotFound(_)
            | Self::WorkspaceNotFound(_)
            | Self::ArchiveMemberNotFound(_) => S3ErrorCode::NoSuchKey,
            Self::BucketNotFound(_) | Self::DataSourceNotFound(_) => S3ErrorCode::NoSuchBucket,
            Self::UploadNotFound(_) => S3ErrorCode::NoSuchUpload,
            Self::Forbidden(_) => S3ErrorCode::AccessDenied,
            Self::InvalidArgument(_) => S3ErrorCode::InvalidArgument,
            Self::MalformedXml(_) => S3ErrorCode::MalformedXML,
            Self::InvalidRequest(_) => S3ErrorCode::InvalidRequest,
            Self::InvalidRange { .. } => S3ErrorCode::InvalidRange,
            Self::Integrity(err) => integrity_code(err),
            Self::StorageFull(_) => S3ErrorCode::StorageFull,
            Self::Conflict(_) => S3ErrorCode::OperationAborted,
            Self::Unavailable(_) => S3ErrorCode::ServiceUnavailable,
            Self::NotImplemented(_) => S3ErrorCode::NotImplemented,
            Self::Cancelled => S3ErrorCode::RequestTimeout,
            Self::Backend { source, .. } => match source {
                ObjectStoreError::InvalidPart { .. } => S3ErrorCode::InvalidPart,
                ObjectStoreError::Connection(_) | ObjectStoreError::Timeout => {
                    S3ErrorCode::ServiceUnavailable
                }
                ObjectStoreError::S3 { status: 503, .. } => S3ErrorCode::ServiceUnavailable,
                ObjectStoreError::S3 { status: 501, .. } => S3ErrorCode::NotImplemented,
                _ => S3ErrorCode::InternalError,
            },
            Self::Io(err) => match find_integrity_error(err) {
                Some(integrity) => integrity_code(integrity),
                None => S3ErrorCode::InternalError,
            },
            Self::Crypto(_) | Self::Internal(_) => S3ErrorCode::InternalError,
        }
    }

    /// Render the S3 XML error body
    pub fn to_xml(&self, request_id: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<Error>
    <Code>{}</Code>
    <Message>{}</Message>
    <RequestId>{}</RequestId>
</Error>"#,
            self.s3_code().as_str(),
            self.to_string()
                .replace('&', "&amp;")
                .replace('<', "&lt;")
                .replace('>', "&gt;"),
            request_id
        )
    }
}

fn integrity_code(err: &IntegrityError) -> S3ErrorCode {
    match err {
        IntegrityError::BadDigest { .. } => S3ErrorCode::BadDigest,
        IntegrityError::Sha256Mismatch { .. } => S3ErrorCode::XAmzContentSHA256Mismatch,
        IntegrityError::IncompleteBody { .. } => S3ErrorCode::IncompleteBody,
        IntegrityError::ChunkAuthentication { .. } => S3ErrorCode::InternalError,
    }
}

impl From<IntegrityError> for CoreError {
    fn from(err: IntegrityError) -> Self {
        CoreError::Integrity(err)
    }
}
