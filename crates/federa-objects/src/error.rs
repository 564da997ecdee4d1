//! Error types for the federa-objects crate

use thiserror::Error;

/// Result type alias using `ObjectStoreError`
pub type Result<T> = std::result::Result<T, ObjectStoreError>;

/// Errors returned by object backends
#[derive(Error, Debug)]
pub enum ObjectStoreError {
    /// Object does not exist
    #[error("no such key: {bucket}/{key}")]
    NoSuchKey { bucket: String, key: String },

    /// Bucket does not exist
    #[error("no such bucket: {0}")]
    NoSuchBucket(String),

    /// Multipart upload does not exist
    #[error("no such upload: {0}")]
    NoSuchUpload(String),

    /// Multipart part referenced in a completion is missing or mismatched
    #[error("invalid part {part_number}: {reason}")]
    InvalidPart { part_number: u32, reason: String },

    /// Requested range cannot be satisfied
    #[error("invalid range: {start}- on object of {size} bytes")]
    InvalidRange { start: u64, size: u64 },

    /// Access denied by the backend
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// S3 error response not covered by a dedicated variant
    #[error("S3 error {code} (status {status}): {message}")]
    S3 {
        status: u16,
        code: String,
        message: String,
    },

    /// Connection error
    #[error("connection error: {0}")]
    Connection(String),

    /// Timeout error
    #[error("operation timed out")]
    Timeout,

    /// HTTP error
    #[error("http error: {0}")]
    Http(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// IO error, including integrity failures raised by verifying readers
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ObjectStoreError {
    /// Build an error from an S3 XML error body
    pub fn from_s3_xml(xml: &str, status: u16, bucket: &str, key: &str) -> Self {
        let code = crate::xml::extract_xml_value(xml, "Code")
            .unwrap_or_else(|| default_code(status).to_string());
        let message = crate::xml::extract_xml_value(xml, "Message").unwrap_or_default();
        match code.as_str() {
            "NoSuchKey" => Self::NoSuchKey {
                bucket: bucket.to_string(),
                key: key.to_string(),
            },
            "NoSuchBucket" => Self::NoSuchBucket(bucket.to_string()),
            "NoSuchUpload" => Self::NoSuchUpload(message),
            "InvalidRange" => Self::InvalidRange { start: 0, size: 0 },
            "AccessDenied" => Self::AccessDenied(message),
            _ => Self::S3 {
                status,
                code,
                message,
            },
        }
    }

    /// Check if this is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NoSuchKey { .. } | Self::NoSuchBucket(_) | Self::NoSuchUpload(_)
        )
    }
}

fn default_code(status: u16) -> &'static str {
    match status {
        404 => "NoSuchKey",
        403 => "AccessDenied",
        416 => "InvalidRange",
        _ => "InternalError",
    }
}

impl From<reqwest::Error> for ObjectStoreError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(integrity) = federa_crypto::find_integrity_error(&err) {
            return ObjectStoreError::Io(integrity.clone().into_io());
        }
        if err.is_timeout() {
            ObjectStoreError::Timeout
        } else if err.is_connect() {
            ObjectStoreError::Connection(err.to_string())
        } else {
            ObjectStoreError::Http(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_s3_xml_no_such_key() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<Error><Code>NoSuchKey</Code><Message>The specified key does not exist.</Message></Error>"#;
        let err = ObjectStoreError::from_s3_xml(xml, 404, "b", "k");
        assert!(matches!(err, ObjectStoreError::NoSuchKey { ref bucket, ref key } if bucket == "b" && key == "k"));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_from_empty_body_uses_status() {
        assert!(matches!(
            ObjectStoreError::from_s3_xml("", 404, "b", "k"),
            ObjectStoreError::NoSuchKey { .. }
        ));
        assert!(matches!(
            ObjectStoreError::from_s3_xml("", 500, "b", "k"),
            ObjectStoreError::S3 { status: 500, .. }
        ));
    }
}
