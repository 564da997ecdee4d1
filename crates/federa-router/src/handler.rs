//! Operation surface shared by the router, every filter and the executor

use async_trait::async_trait;
use federa_core::{ListNodesRequest, Node, NodeStream, RequestContext, Result};
use federa_crypto::DekKey;
use federa_objects::{CompletePart, Metadata, MultipartUploadInfo, ObjectInfo, ObjectReader, PartInfo};

/// Parameters of a read
#[derive(Clone, Debug, Default)]
pub struct GetRequest {
    pub offset: u64,
    /// Bytes to read from `offset`; zero or negative reads to the end
    pub length: i64,
    pub version_id: Option<String>,
    /// Data key, attached by the encryption filter
    pub encryption_key: Option<DekKey>,
}

impl GetRequest {
    pub fn range(offset: u64, length: i64) -> Self {
        Self {
            offset,
            length,
            ..Default::default()
        }
    }

    pub fn version(version_id: impl Into<String>) -> Self {
        Self {
            version_id: Some(version_id.into()),
            ..Default::default()
        }
    }

    pub fn is_ranged(&self) -> bool {
        self.offset > 0 || self.length > 0
    }
}

/// Parameters and body of a write
pub struct PutRequest {
    pub reader: ObjectReader,
    /// Declared length; negative when unknown
    pub size: i64,
    /// Client-supplied MD5, hex or base64
    pub md5: Option<String>,
    /// Client-supplied SHA-256, hex
    pub sha256: Option<String>,
    pub content_type: Option<String>,
    pub metadata: Metadata,
    pub encryption_key: Option<DekKey>,
}

impl PutRequest {
    pub fn new(reader: ObjectReader, size: i64) -> Self {
        Self {
            reader,
            size,
            md5: None,
            sha256: None,
            content_type: None,
            metadata: Metadata::new(),
            encryption_key: None,
        }
    }

    /// Body held in memory
    pub fn from_bytes(data: impl Into<bytes::Bytes>) -> Self {
        let data = data.into();
        let size = data.len() as i64;
        Self::new(Box::pin(std::io::Cursor::new(data)), size)
    }

    pub fn with_md5(mut self, md5: impl Into<String>) -> Self {
        self.md5 = Some(md5.into());
        self
    }

    pub fn with_sha256(mut self, sha256: impl Into<String>) -> Self {
        self.sha256 = Some(sha256.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Declared size, when known
    pub fn known_size(&self) -> Option<u64> {
        u64::try_from(self.size).ok()
    }
}

impl std::fmt::Debug for PutRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PutRequest")
            .field("size", &self.size)
            .field("md5", &self.md5)
            .field("content_type", &self.content_type)
            .field("metadata", &self.metadata)
            .field("encrypted", &self.encryption_key.is_some())
            .finish()
    }
}

/// Parameters of a copy
#[derive(Clone, Debug, Default)]
pub struct CopyRequest {
    /// Replacement metadata; `None` keeps the source's
    pub metadata: Option<Metadata>,
    pub src_version_id: Option<String>,
    pub src_encryption_key: Option<DekKey>,
    pub dest_encryption_key: Option<DekKey>,
}

/// Parameters of a multipart upload creation
#[derive(Clone, Debug, Default)]
pub struct MultipartCreateRequest {
    pub content_type: Option<String>,
    pub metadata: Metadata,
}

/// Node and object operations. Implemented by the router, by [`crate::Next`]
/// and by the executor.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn read_node(&self, ctx: RequestContext, node: Node) -> Result<Node>;

    async fn list_nodes(&self, ctx: RequestContext, req: ListNodesRequest) -> Result<NodeStream>;

    async fn create_node(&self, ctx: RequestContext, node: Node) -> Result<Node>;

    async fn update_node(&self, ctx: RequestContext, from: Node, to: Node) -> Result<Node>;

    async fn delete_node(&self, ctx: RequestContext, node: Node) -> Result<()>;

    async fn get_object(&self, ctx: RequestContext, node: Node, req: GetRequest) -> Result<ObjectReader>;

    async fn put_object(&self, ctx: RequestContext, node: Node, req: PutRequest) -> Result<ObjectInfo>;

    async fn copy_object(
        &self,
        ctx: RequestContext,
        from: Node,
        to: Node,
        req: CopyRequest,
    ) -> Result<ObjectInfo>;

    async fn multipart_create(
        &self,
        ctx: RequestContext,
        node: Node,
        req: MultipartCreateRequest,
    ) -> Result<String>;

    /// Uploads pending under `node`, used as a prefix
    async fn multipart_list(&self, ctx: RequestContext, node: Node) -> Result<Vec<MultipartUploadInfo>>;

    async fn multipart_abort(&self, ctx: RequestContext, node: Node, upload_id: String) -> Result<()>;

    async fn multipart_complete(
        &self,
        ctx: RequestContext,
        node: Node,
        upload_id: String,
        parts: Vec<CompletePart>,
    ) -> Result<ObjectInfo>;

    async fn multipart_list_parts(
        &self,
        ctx: RequestContext,
        node: Node,
        upload_id: String,
    ) -> Result<Vec<PartInfo>>;

    async fn multipart_put_part(
        &self,
        ctx: RequestContext,
        node: Node,
        upload_id: String,
        part_number: u32,
        req: PutRequest,
    ) -> Result<PartInfo>;
}
