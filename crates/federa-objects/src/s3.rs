//! S3 HTTP backend
//!
//! Path-style requests over `reqwest`. Authentication is a bearer token when
//! configured; request signing is left to a fronting proxy.

use crate::{
    error::ObjectStoreError,
    xml::{escape_xml, extract_xml_blocks, extract_xml_value},
    ByteRange, CompletePart, GetOptions, ListObjectsResult, Metadata, MultipartUploadInfo,
    ObjectBackend, ObjectInfo, ObjectReader, PartInfo, PutOptions, Result,
};
use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use reqwest::{header::HeaderMap, Method, RequestBuilder, Response};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, instrument};

const META_PREFIX: &str = "x-amz-meta-";

/// Configuration for one S3 endpoint
#[derive(Clone, Debug)]
pub struct S3BackendConfig {
    /// Endpoint URL, e.g. `http://localhost:9000`
    pub endpoint: String,
    /// Optional bearer token sent on every request
    pub access_token: Option<String>,
    /// Request timeout
    pub timeout: Duration,
}

impl Default for S3BackendConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9000".to_string(),
            access_token: None,
            timeout: Duration::from_secs(300),
        }
    }
}

impl S3BackendConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// S3 client for one data source endpoint
pub struct S3HttpClient {
    name: String,
    config: S3BackendConfig,
    http: reqwest::Client,
}

impl S3HttpClient {
    pub fn new(name: impl Into<String>, config: S3BackendConfig) -> Result<Self> {
        url::Url::parse(&config.endpoint)
            .map_err(|e| ObjectStoreError::Configuration(format!("invalid endpoint: {}", e)))?;
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ObjectStoreError::Configuration(e.to_string()))?;
        Ok(Self {
            name: name.into(),
            config,
            http,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    fn object_path(bucket: &str, key: &str) -> String {
        let encoded: Vec<String> = key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        format!("/{}/{}", bucket, encoded.join("/"))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.config.endpoint.trim_end_matches('/'), path);
        debug!("Sending {} request to {}", method, url);
        let mut req = self.http.request(method, &url);
        if let Some(token) = &self.config.access_token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }
        req
    }

    async fn send(&self, req: RequestBuilder, bucket: &str, key: &str) -> Result<Response> {
        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ObjectStoreError::from_s3_xml(&text, status.as_u16(), bucket, key));
        }
        Ok(response)
    }

    fn put_headers(mut req: RequestBuilder, opts: &PutOptions) -> RequestBuilder {
        if let Some(md5) = opts.md5.as_deref().filter(|s| !s.is_empty()) {
            if let Ok(raw) = hex::decode(md5) {
                req = req.header(
                    "Content-MD5",
                    base64::engine::general_purpose::STANDARD.encode(raw),
                );
            }
        }
        if let Some(sha) = opts.sha256.as_deref().filter(|s| !s.is_empty()) {
            req = req.header("x-amz-content-sha256", sha);
        }
        if let Some(content_type) = &opts.content_type {
            req = req.header("Content-Type", content_type);
        }
        for (name, value) in &opts.metadata {
            req = req.header(name.as_str(), value.as_str());
        }
        req
    }

    /// Attach a streaming body. The reader is pumped from its own task into
    /// a channel so read errors surface as body errors on the request.
    fn body(reader: ObjectReader, size: Option<u64>, req: RequestBuilder) -> RequestBuilder {
        let req = match size {
            Some(size) => req.header("Content-Length", size),
            None => req,
        };
        let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(4);
        tokio::spawn(async move {
            let mut chunks = ReaderStream::new(reader);
            while let Some(chunk) = chunks.next().await {
                let failed = chunk.is_err();
                if tx.send(chunk).await.is_err() || failed {
                    break;
                }
            }
        });
        req.body(reqwest::Body::wrap_stream(ReceiverStream::new(rx)))
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .or_else(|_| DateTime::parse_from_rfc2822(s))
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

fn trim_etag(s: &str) -> String {
    s.trim_matches('"').to_string()
}

fn info_from_headers(key: &str, headers: &HeaderMap) -> ObjectInfo {
    let mut metadata = Metadata::new();
    for (name, value) in headers {
        if name.as_str().starts_with(META_PREFIX) {
            if let Ok(v) = value.to_str() {
                metadata.insert(name.as_str().to_string(), v.to_string());
            }
        }
    }
    ObjectInfo {
        key: key.to_string(),
        size: header_str(headers, "content-length")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
        etag: header_str(headers, "etag").map(trim_etag).unwrap_or_default(),
        last_modified: header_str(headers, "last-modified")
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now),
        content_type: header_str(headers, "content-type").map(str::to_string),
        metadata,
    }
}

fn parse_list_objects(xml: &str, result: &mut ListObjectsResult) -> Option<String> {
    for block in extract_xml_blocks(xml, "Contents") {
        if let Some(key) = extract_xml_value(block, "Key") {
            let mut info = ObjectInfo::new(
                key,
                extract_xml_value(block, "Size")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0),
                extract_xml_value(block, "ETag")
                    .map(|s| trim_etag(&s))
                    .unwrap_or_default(),
            );
            if let Some(ts) = extract_xml_value(block, "LastModified").and_then(|s| parse_timestamp(&s)) {
                info.last_modified = ts;
            }
            result.objects.push(info);
        }
    }
    for block in extract_xml_blocks(xml, "CommonPrefixes") {
        if let Some(prefix) = extract_xml_value(block, "Prefix") {
            result.common_prefixes.push(prefix);
        }
    }
    let truncated = extract_xml_value(xml, "IsTruncated")
        .map(|s| s == "true")
        .unwrap_or(false);
    if truncated {
        extract_xml_value(xml, "NextContinuationToken")
    } else {
        None
    }
}

fn parse_parts(xml: &str) -> Vec<PartInfo> {
    extract_xml_blocks(xml, "Part")
        .into_iter()
        .filter_map(|block| {
            Some(PartInfo {
                part_number: extract_xml_value(block, "PartNumber")?.parse().ok()?,
                etag: extract_xml_value(block, "ETag")
                    .map(|s| trim_etag(&s))
                    .unwrap_or_default(),
                size: extract_xml_value(block, "Size")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0),
                last_modified: extract_xml_value(block, "LastModified")
                    .and_then(|s| parse_timestamp(&s))
                    .unwrap_or_else(Utc::now),
            })
        })
        .collect()
}

fn parse_uploads(xml: &str) -> Vec<MultipartUploadInfo> {
    extract_xml_blocks(xml, "Upload")
        .into_iter()
        .filter_map(|block| {
            Some(MultipartUploadInfo {
                key: extract_xml_value(block, "Key")?,
                upload_id: extract_xml_value(block, "UploadId")?,
                initiated: extract_xml_value(block, "Initiated")
                    .and_then(|s| parse_timestamp(&s))
                    .unwrap_or_else(Utc::now),
            })
        })
        .collect()
}

fn complete_body(parts: &[CompletePart]) -> String {
    let mut xml = String::from("<CompleteMultipartUpload>");
    for part in parts {
        xml.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>\"{}\"</ETag></Part>",
            part.part_number,
            escape_xml(part.etag.trim_matches('"'))
        ));
    }
    xml.push_str("</CompleteMultipartUpload>");
    xml
}

#[async_trait]
impl ObjectBackend for S3HttpClient {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, opts), fields(source = %self.name))]
    async fn get_object(&self, bucket: &str, key: &str, opts: GetOptions) -> Result<ObjectReader> {
        let mut req = self.request(Method::GET, &Self::object_path(bucket, key));
        if let Some(range) = opts.range.as_ref().map(ByteRange::header_value) {
            req = req.header("Range", range);
        }
        if let Some(version) = &opts.version_id {
            req = req.query(&[("versionId", version)]);
        }
        let response = self.send(req, bucket, key).await.map_err(|e| match (e, opts.range) {
            (ObjectStoreError::InvalidRange { .. }, Some(range)) => ObjectStoreError::InvalidRange {
                start: range.start,
                size: 0,
            },
            (e, _) => e,
        })?;
        let stream = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        Ok(Box::pin(StreamReader::new(stream)))
    }

    #[instrument(skip(self), fields(source = %self.name))]
    async fn stat_object(&self, bucket: &str, key: &str) -> Result<ObjectInfo> {
        let req = self.request(Method::HEAD, &Self::object_path(bucket, key));
        let response = self.send(req, bucket, key).await?;
        Ok(info_from_headers(key, response.headers()))
    }

    #[instrument(skip(self, reader, opts), fields(source = %self.name))]
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        reader: ObjectReader,
        size: Option<u64>,
        opts: PutOptions,
    ) -> Result<ObjectInfo> {
        let req = self.request(Method::PUT, &Self::object_path(bucket, key));
        let req = Self::body(reader, size, Self::put_headers(req, &opts));
        let response = self.send(req, bucket, key).await?;

        let mut info = ObjectInfo::new(
            key,
            size.unwrap_or(0),
            header_str(response.headers(), "etag")
                .map(trim_etag)
                .unwrap_or_default(),
        );
        info.content_type = opts.content_type;
        info.metadata = opts.metadata;
        Ok(info)
    }

    #[instrument(skip(self, metadata), fields(source = %self.name))]
    async fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
        metadata: Option<Metadata>,
    ) -> Result<ObjectInfo> {
        let mut req = self
            .request(Method::PUT, &Self::object_path(dst_bucket, dst_key))
            .header("x-amz-copy-source", Self::object_path(src_bucket, src_key));
        if let Some(meta) = &metadata {
            req = req.header("x-amz-metadata-directive", "REPLACE");
            for (name, value) in meta {
                req = req.header(name.as_str(), value.as_str());
            }
        }
        let response = self.send(req, src_bucket, src_key).await?;
        let xml = response.text().await?;

        let mut info = ObjectInfo::new(
            dst_key,
            0,
            extract_xml_value(&xml, "ETag")
                .map(|s| trim_etag(&s))
                .unwrap_or_default(),
        );
        if let Some(ts) = extract_xml_value(&xml, "LastModified").and_then(|s| parse_timestamp(&s)) {
            info.last_modified = ts;
        }
        info.metadata = metadata.unwrap_or_default();
        Ok(info)
    }

    #[instrument(skip(self), fields(source = %self.name))]
    async fn remove_object(&self, bucket: &str, key: &str) -> Result<()> {
        let req = self.request(Method::DELETE, &Self::object_path(bucket, key));
        match self.send(req, bucket, key).await {
            Ok(_) | Err(ObjectStoreError::NoSuchKey { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), fields(source = %self.name))]
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        recursive: bool,
    ) -> Result<ListObjectsResult> {
        let mut result = ListObjectsResult::default();
        let mut token: Option<String> = None;
        loop {
            let mut query: Vec<(&str, String)> = vec![
                ("list-type", "2".to_string()),
                ("prefix", prefix.to_string()),
            ];
            if !recursive {
                query.push(("delimiter", "/".to_string()));
            }
            if let Some(t) = &token {
                query.push(("continuation-token", t.clone()));
            }
            let req = self.request(Method::GET, &format!("/{}", bucket)).query(&query);
            let xml = self.send(req, bucket, prefix).await?.text().await?;
            token = parse_list_objects(&xml, &mut result);
            if token.is_none() {
                break;
            }
        }
        Ok(result)
    }

    async fn new_multipart_upload(&self, bucket: &str, key: &str, opts: PutOptions) -> Result<String> {
        let req = self
            .request(Method::POST, &Self::object_path(bucket, key))
            .query(&[("uploads", "")]);
        let req = Self::put_headers(req, &opts);
        let xml = self.send(req, bucket, key).await?.text().await?;
        extract_xml_value(&xml, "UploadId").ok_or_else(|| ObjectStoreError::S3 {
            status: 200,
            code: "MalformedXML".to_string(),
            message: "missing UploadId in response".to_string(),
        })
    }

    async fn list_multipart_uploads(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<MultipartUploadInfo>> {
        let req = self
            .request(Method::GET, &format!("/{}", bucket))
            .query(&[("uploads", ""), ("prefix", prefix)]);
        let xml = self.send(req, bucket, prefix).await?.text().await?;
        Ok(parse_uploads(&xml))
    }

    async fn list_object_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<Vec<PartInfo>> {
        let req = self
            .request(Method::GET, &Self::object_path(bucket, key))
            .query(&[("uploadId", upload_id)]);
        let xml = self.send(req, bucket, key).await?.text().await?;
        Ok(parse_parts(&xml))
    }

    #[instrument(skip(self, reader, opts), fields(source = %self.name))]
    async fn put_object_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        reader: ObjectReader,
        size: Option<u64>,
        opts: PutOptions,
    ) -> Result<PartInfo> {
        let req = self
            .request(Method::PUT, &Self::object_path(bucket, key))
            .query(&[
                ("partNumber", part_number.to_string()),
                ("uploadId", upload_id.to_string()),
            ]);
        let req = Self::body(reader, size, Self::put_headers(req, &opts));
        let response = self.send(req, bucket, key).await?;
        Ok(PartInfo {
            part_number,
            etag: header_str(response.headers(), "etag")
                .map(trim_etag)
                .unwrap_or_default(),
            size: size.unwrap_or(0),
            last_modified: Utc::now(),
        })
    }

    #[instrument(skip(self, parts), fields(source = %self.name))]
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletePart>,
    ) -> Result<ObjectInfo> {
        let req = self
            .request(Method::POST, &Self::object_path(bucket, key))
            .query(&[("uploadId", upload_id)])
            .header("Content-Type", "application/xml")
            .body(Bytes::from(complete_body(&parts)));
        let xml = self.send(req, bucket, key).await?.text().await?;
        // S3 may report a failed completion with a 200 and an error body
        if extract_xml_value(&xml, "Code").is_some() {
            return Err(ObjectStoreError::from_s3_xml(&xml, 200, bucket, key));
        }
        Ok(ObjectInfo::new(
            key,
            0,
            extract_xml_value(&xml, "ETag")
                .map(|s| trim_etag(&s))
                .unwrap_or_default(),
        ))
    }

    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()> {
        let req = self
            .request(Method::DELETE, &Self::object_path(bucket, key))
            .query(&[("uploadId", upload_id)]);
        self.send(req, bucket, key).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client(server: &MockServer) -> S3HttpClient {
        S3HttpClient::new("ds1", S3BackendConfig::new(server.uri()).with_token("secret")).unwrap()
    }

    #[test]
    fn test_object_path_encodes_segments() {
        assert_eq!(
            S3HttpClient::object_path("data", "home/alice/my file.txt"),
            "/data/home/alice/my%20file.txt"
        );
    }

    #[test]
    fn test_invalid_endpoint_rejected() {
        assert!(S3HttpClient::new("x", S3BackendConfig::new("not a url")).is_err());
    }

    #[tokio::test]
    async fn test_get_object_with_range() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data/a/b.txt"))
            .and(header("Range", "bytes=2-4"))
            .and(header("Authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(b"234".to_vec()))
            .mount(&server)
            .await;

        let opts = GetOptions {
            range: Some(ByteRange::from_offset(2, 3)),
            ..Default::default()
        };
        let mut reader = client(&server).await.get_object("data", "a/b.txt", opts).await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"234");
    }

    #[tokio::test]
    async fn test_missing_object_maps_to_no_such_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string(
                "<Error><Code>NoSuchKey</Code><Message>missing</Message></Error>",
            ))
            .mount(&server)
            .await;

        let err = match client(&server).await.get_object("data", "k", GetOptions::default()).await {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(matches!(err, ObjectStoreError::NoSuchKey { .. }));
    }

    #[tokio::test]
    async fn test_stat_object_reads_headers() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/data/k"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-length", "12")
                    .insert_header("etag", "\"abc\"")
                    .insert_header("x-amz-meta-pydio-node-uuid", "u-1"),
            )
            .mount(&server)
            .await;

        let info = client(&server).await.stat_object("data", "k").await.unwrap();
        assert_eq!(info.etag, "abc");
        assert_eq!(crate::meta_get(&info.metadata, "X-Amz-Meta-Pydio-Node-Uuid"), Some("u-1"));
    }

    #[tokio::test]
    async fn test_put_object_sends_digest_and_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/data/k"))
            .and(header("Content-MD5", "XUFAKrxLKna5cZ2REBfFkg=="))
            .and(header("x-amz-meta-pydio-node-uuid", "u-1"))
            .respond_with(ResponseTemplate::new(200).insert_header("etag", "\"5d41402abc4b2a76b9719d911017c592\""))
            .mount(&server)
            .await;

        let mut metadata = Metadata::new();
        metadata.insert("X-Amz-Meta-Pydio-Node-Uuid".into(), "u-1".into());
        let opts = PutOptions {
            md5: Some("5d41402abc4b2a76b9719d911017c592".into()),
            metadata,
            ..Default::default()
        };
        let info = client(&server)
            .await
            .put_object("data", "k", Box::pin(&b"hello"[..]), Some(5), opts)
            .await
            .unwrap();
        assert_eq!(info.etag, "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(info.size, 5);
    }

    #[tokio::test]
    async fn test_list_objects_follows_continuation() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data"))
            .and(query_param("continuation-token", "t1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<ListBucketResult><IsTruncated>false</IsTruncated>\
                 <Contents><Key>p/b</Key><Size>2</Size><ETag>\"e2\"</ETag></Contents></ListBucketResult>",
            ))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/data"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<ListBucketResult><IsTruncated>true</IsTruncated><NextContinuationToken>t1</NextContinuationToken>\
                 <Contents><Key>p/a</Key><Size>1</Size><ETag>\"e1\"</ETag></Contents>\
                 <CommonPrefixes><Prefix>p/sub/</Prefix></CommonPrefixes></ListBucketResult>",
            ))
            .with_priority(2)
            .mount(&server)
            .await;

        let result = client(&server).await.list_objects("data", "p/", false).await.unwrap();
        let keys: Vec<_> = result.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["p/a", "p/b"]);
        assert_eq!(result.common_prefixes, vec!["p/sub/".to_string()]);
    }

    #[tokio::test]
    async fn test_multipart_create_and_complete() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/data/big"))
            .and(query_param("uploads", ""))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<InitiateMultipartUploadResult><UploadId>up-1</UploadId></InitiateMultipartUploadResult>",
            ))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/data/big"))
            .and(query_param("uploadId", "up-1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<CompleteMultipartUploadResult><ETag>\"abc-2\"</ETag></CompleteMultipartUploadResult>",
            ))
            .mount(&server)
            .await;

        let s3 = client(&server).await;
        let id = s3.new_multipart_upload("data", "big", PutOptions::default()).await.unwrap();
        assert_eq!(id, "up-1");
        let info = s3
            .complete_multipart_upload(
                "data",
                "big",
                &id,
                vec![CompletePart { part_number: 1, etag: "e".into() }],
            )
            .await
            .unwrap();
        assert_eq!(info.etag, "abc-2");
    }

    #[test]
    fn test_complete_body_quotes_etags() {
        let xml = complete_body(&[CompletePart { part_number: 3, etag: "\"x\"".into() }]);
        assert_eq!(
            xml,
            "<CompleteMultipartUpload><Part><PartNumber>3</PartNumber><ETag>\"x\"</ETag></Part></CompleteMultipartUpload>"
        );
    }
}
