//! Terminal handler: node operations go to the tree client, object
//! operations to the backend resolved for the branch.

use crate::handler::{CopyRequest, GetRequest, Handler, MultipartCreateRequest, PutRequest};
use async_trait::async_trait;
use chrono::Utc;
use federa_core::node::{join_path, trim_path};
use federa_core::{
    BranchKey, CoreError, DsInfo, ListNodesRequest, Node, NodeAttr, NodeStream, RequestContext,
    Result, MARKER, META_NODE_UUID,
};
use federa_crypto::streaming::{META_CEK_ALG, META_IV, META_UNENCRYPTED_LENGTH};
use federa_crypto::{normalize_md5, EncryptionMaterial, HashingReader};
use federa_objects::{
    meta_get, ByteRange, CompletePart, GetOptions, Metadata, MultipartUploadInfo, ObjectInfo,
    ObjectReader, ObjectStoreError, PartInfo, PutOptions,
};
use std::io::Cursor;
use tokio::io::AsyncReadExt;
use tracing::{debug, instrument, warn};

/// Leaf of every filter chain
#[derive(Debug, Default, Clone, Copy)]
pub struct Executor;

impl Executor {
    pub fn new() -> Self {
        Self
    }
}

fn branch_ds(ctx: &RequestContext, key: BranchKey) -> Result<DsInfo> {
    ctx.ds(key).cloned().ok_or_else(|| {
        CoreError::DataSourceNotFound(format!("no data source resolved for the {:?} branch", key))
    })
}

/// Location of the node inside its data source
fn ds_path(node: &Node) -> Result<String> {
    node.attr(NodeAttr::DataSourcePath)
        .map(|p| trim_path(p).to_string())
        .ok_or_else(|| CoreError::InvalidArgument(format!("{} carries no datasource-path", node.path)))
}

fn object_key(node: &Node) -> Result<String> {
    let key = ds_path(node)?;
    if key.is_empty() {
        return Err(CoreError::InvalidArgument(format!("{} does not address an object", node.path)));
    }
    Ok(key)
}

fn is_encryption_meta(name: &str) -> bool {
    [META_IV, META_CEK_ALG, META_UNENCRYPTED_LENGTH]
        .iter()
        .any(|m| m.eq_ignore_ascii_case(name))
}

fn ignore_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(err) if err.is_not_found() => Ok(()),
        other => other,
    }
}

/// Skip `offset` bytes and cap the rest at `length` (when positive)
pub(crate) async fn apply_range(mut reader: ObjectReader, offset: u64, length: i64, bucket: &str, key: &str) -> Result<ObjectReader> {
    if offset > 0 {
        let skipped = tokio::io::copy(&mut (&mut reader).take(offset), &mut tokio::io::sink()).await?;
        if skipped < offset {
            return Err(CoreError::InvalidRange {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
    }
    Ok(match u64::try_from(length) {
        Ok(length) if length > 0 => Box::pin(reader.take(length)),
        _ => reader,
    })
}

impl Executor {
    /// Open an object, decrypting when a data key is attached
    async fn open(&self, ds: &DsInfo, key: &str, req: &GetRequest) -> Result<ObjectReader> {
        let backend = |e: ObjectStoreError| CoreError::backend(&ds.bucket, key, e);
        let Some(dek) = req.encryption_key.clone() else {
            let opts = GetOptions {
                range: req.is_ranged().then(|| ByteRange::from_offset(req.offset, req.length)),
                version_id: req.version_id.clone().filter(|v| !v.is_empty()),
            };
            return ds.client.get_object(&ds.bucket, key, opts).await.map_err(backend);
        };

        let info = ds.client.stat_object(&ds.bucket, key).await.map_err(backend)?;
        let material = EncryptionMaterial::from_metadata(
            dek,
            info.metadata.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        )?;
        let plain = meta_get(&info.metadata, META_UNENCRYPTED_LENGTH)
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| material.plain_size(info.size));
        let body = ds
            .client
            .get_object(&ds.bucket, key, GetOptions::default())
            .await
            .map_err(backend)?;
        let reader: ObjectReader = Box::pin(material.decrypt_reader(body, Some(plain)));
        apply_range(reader, req.offset, req.length, &ds.bucket, key).await
    }

    /// Stream a body into an object, verifying digests and size on the way
    async fn store(&self, ds: &DsInfo, key: &str, req: PutRequest) -> Result<ObjectInfo> {
        let md5 = req
            .md5
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(normalize_md5)
            .transpose()
            .map_err(|e| CoreError::InvalidArgument(format!("Content-MD5: {}", e)))?;
        let size = req.known_size();
        let hashing = HashingReader::new(req.reader)
            .with_md5(md5.clone())
            .with_sha256(req.sha256.clone())
            .with_size(size);
        let probe = hashing.probe();

        let content_type = req.content_type.or_else(|| {
            mime_guess::from_path(key)
                .first()
                .map(|m| m.essence_str().to_string())
        });
        let mut opts = PutOptions {
            content_type,
            metadata: req.metadata,
            ..Default::default()
        };
        let (reader, stored_size): (ObjectReader, Option<u64>) = match req.encryption_key {
            Some(dek) => {
                let material = EncryptionMaterial::new(dek);
                opts.metadata.extend(material.metadata(size));
                let stored = size.map(|s| material.encrypted_size(s));
                (Box::pin(material.encrypt_reader(hashing)), stored)
            }
            None => {
                opts.md5 = md5;
                opts.sha256 = req.sha256;
                (Box::pin(hashing), size)
            }
        };

        match ds.client.put_object(&ds.bucket, key, reader, stored_size, opts).await {
            Ok(info) => {
                debug!(bucket = %ds.bucket, key, etag = %info.etag, size = info.size, "Object stored");
                Ok(info)
            }
            Err(err) => Err(match probe.failure() {
                Some(integrity) => CoreError::Integrity(integrity),
                None => CoreError::backend(&ds.bucket, key, err),
            }),
        }
    }

    /// Remove everything stored under a collection, pending uploads included
    async fn purge_prefix(&self, ds: &DsInfo, dir: &str) -> Result<usize> {
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{}/", dir)
        };
        let listing = ds
            .client
            .list_objects(&ds.bucket, &prefix, true)
            .await
            .map_err(|e| CoreError::backend(&ds.bucket, &prefix, e))?;
        for object in &listing.objects {
            ds.client
                .remove_object(&ds.bucket, &object.key)
                .await
                .map_err(|e| CoreError::backend(&ds.bucket, &object.key, e))?;
        }
        let uploads = ds
            .client
            .list_multipart_uploads(&ds.bucket, &prefix)
            .await
            .map_err(|e| CoreError::backend(&ds.bucket, &prefix, e))?;
        for upload in &uploads {
            ds.client
                .abort_multipart_upload(&ds.bucket, &upload.key, &upload.upload_id)
                .await
                .map_err(|e| CoreError::backend(&ds.bucket, &upload.key, e))?;
        }
        debug!(
            bucket = %ds.bucket,
            prefix = %prefix,
            objects = listing.objects.len(),
            uploads = uploads.len(),
            "Purged collection"
        );
        Ok(listing.objects.len())
    }
}

#[async_trait]
impl Handler for Executor {
    async fn read_node(&self, ctx: RequestContext, node: Node) -> Result<Node> {
        ctx.tree()?.read_node(&node).await
    }

    async fn list_nodes(&self, ctx: RequestContext, req: ListNodesRequest) -> Result<NodeStream> {
        ctx.tree()?.list_nodes(req).await
    }

    #[instrument(skip_all, fields(path = %node.path))]
    async fn create_node(&self, ctx: RequestContext, node: Node) -> Result<Node> {
        let tree = ctx.tree()?;
        if node.is_leaf() {
            return tree.create_node(node).await;
        }

        let ds = branch_ds(&ctx, BranchKey::In)?;
        let dir = object_key(&node)?;
        let uuid = if node.uuid.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            node.uuid.clone()
        };
        let marker = join_path(&dir, MARKER);
        let mut opts = PutOptions {
            content_type: Some("text/plain".to_string()),
            ..Default::default()
        };
        opts.metadata.insert(META_NODE_UUID.to_string(), uuid.clone());
        let body = uuid.clone().into_bytes();
        let len = body.len() as u64;
        ds.client
            .put_object(&ds.bucket, &marker, Box::pin(Cursor::new(body)), Some(len), opts)
            .await
            .map_err(|e| CoreError::backend(&ds.bucket, &marker, e))?;

        let mut created = Node::collection(node.path.clone())
            .uuid(uuid)
            .mtime(Utc::now().timestamp());
        created.meta = node.meta;
        tree.create_node(created).await
    }

    async fn update_node(&self, ctx: RequestContext, from: Node, to: Node) -> Result<Node> {
        ctx.tree()?.update_node(&from, to).await
    }

    #[instrument(skip_all, fields(path = %node.path))]
    async fn delete_node(&self, ctx: RequestContext, node: Node) -> Result<()> {
        let tree = ctx.tree()?;
        let indexed = match tree.read_node(&node).await {
            Ok(indexed) => Some(indexed),
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err),
        };
        let is_collection = indexed.as_ref().map_or(node.is_collection(), Node::is_collection);
        let ds = branch_ds(&ctx, BranchKey::In)?;

        if is_collection {
            self.purge_prefix(&ds, &ds_path(&node)?).await?;
        } else {
            let key = object_key(&node)?;
            ds.client
                .remove_object(&ds.bucket, &key)
                .await
                .map_err(|e| CoreError::backend(&ds.bucket, &key, e))?;
        }
        match indexed {
            Some(indexed) => ignore_not_found(tree.delete_node(&indexed).await),
            None => Ok(()),
        }
    }

    #[instrument(skip_all, fields(path = %node.path, offset = req.offset, length = req.length))]
    async fn get_object(&self, ctx: RequestContext, node: Node, req: GetRequest) -> Result<ObjectReader> {
        ctx.check_cancelled()?;
        let ds = branch_ds(&ctx, BranchKey::In)?;
        let key = object_key(&node)?;
        self.open(&ds, &key, &req).await
    }

    #[instrument(skip_all, fields(path = %node.path, size = req.size))]
    async fn put_object(&self, ctx: RequestContext, node: Node, req: PutRequest) -> Result<ObjectInfo> {
        ctx.check_cancelled()?;
        let ds = branch_ds(&ctx, BranchKey::In)?;
        let key = object_key(&node)?;
        self.store(&ds, &key, req).await
    }

    #[instrument(skip_all, fields(from = %from.path, to = %to.path))]
    async fn copy_object(
        &self,
        ctx: RequestContext,
        from: Node,
        to: Node,
        req: CopyRequest,
    ) -> Result<ObjectInfo> {
        ctx.check_cancelled()?;
        let src = branch_ds(&ctx, BranchKey::From)?;
        let dst = branch_ds(&ctx, BranchKey::To)?;
        let src_key = object_key(&from)?;
        let dst_key = object_key(&to)?;

        if src.same_client(&dst)
            && req.src_encryption_key.is_none()
            && req.dest_encryption_key.is_none()
        {
            debug!(src = %src_key, dst = %dst_key, "Server-side copy");
            return src
                .client
                .copy_object(&src.bucket, &src_key, &dst.bucket, &dst_key, req.metadata)
                .await
                .map_err(|e| CoreError::backend(&dst.bucket, &dst_key, e));
        }

        let info = src
            .client
            .stat_object(&src.bucket, &src_key)
            .await
            .map_err(|e| CoreError::backend(&src.bucket, &src_key, e))?;
        let size = match &req.src_encryption_key {
            Some(_) => meta_get(&info.metadata, META_UNENCRYPTED_LENGTH)
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(-1),
            None => info.size as i64,
        };
        let metadata = req.metadata.unwrap_or_else(|| {
            info.metadata
                .iter()
                .filter(|(k, _)| !is_encryption_meta(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Metadata>()
        });

        debug!(src = %src_key, dst = %dst_key, size, "Streamed copy");
        let reader = self
            .open(
                &src,
                &src_key,
                &GetRequest {
                    encryption_key: req.src_encryption_key,
                    ..Default::default()
                },
            )
            .await?;
        let mut put = PutRequest::new(reader, size);
        put.content_type = info.content_type;
        put.metadata = metadata;
        put.encryption_key = req.dest_encryption_key;
        let result = self.store(&dst, &dst_key, put).await;
        if let Err(err) = &result {
            warn!(src = %src_key, dst = %dst_key, error = %err, "Streamed copy failed");
        }
        result
    }

    async fn multipart_create(
        &self,
        ctx: RequestContext,
        node: Node,
        req: MultipartCreateRequest,
    ) -> Result<String> {
        let ds = branch_ds(&ctx, BranchKey::In)?;
        let key = object_key(&node)?;
        let opts = PutOptions {
            content_type: req.content_type,
            metadata: req.metadata,
            ..Default::default()
        };
        ds.client
            .new_multipart_upload(&ds.bucket, &key, opts)
            .await
            .map_err(|e| CoreError::backend(&ds.bucket, &key, e))
    }

    async fn multipart_list(&self, ctx: RequestContext, node: Node) -> Result<Vec<MultipartUploadInfo>> {
        let ds = branch_ds(&ctx, BranchKey::In)?;
        let prefix = ds_path(&node)?;
        ds.client
            .list_multipart_uploads(&ds.bucket, &prefix)
            .await
            .map_err(|e| CoreError::backend(&ds.bucket, &prefix, e))
    }

    async fn multipart_abort(&self, ctx: RequestContext, node: Node, upload_id: String) -> Result<()> {
        let ds = branch_ds(&ctx, BranchKey::In)?;
        let key = object_key(&node)?;
        ds.client
            .abort_multipart_upload(&ds.bucket, &key, &upload_id)
            .await
            .map_err(|e| CoreError::backend(&ds.bucket, &key, e))
    }

    async fn multipart_complete(
        &self,
        ctx: RequestContext,
        node: Node,
        upload_id: String,
        parts: Vec<CompletePart>,
    ) -> Result<ObjectInfo> {
        let ds = branch_ds(&ctx, BranchKey::In)?;
        let key = object_key(&node)?;
        ds.client
            .complete_multipart_upload(&ds.bucket, &key, &upload_id, parts)
            .await
            .map_err(|e| CoreError::backend(&ds.bucket, &key, e))
    }

    async fn multipart_list_parts(
        &self,
        ctx: RequestContext,
        node: Node,
        upload_id: String,
    ) -> Result<Vec<PartInfo>> {
        let ds = branch_ds(&ctx, BranchKey::In)?;
        let key = object_key(&node)?;
        ds.client
            .list_object_parts(&ds.bucket, &key, &upload_id)
            .await
            .map_err(|e| CoreError::backend(&ds.bucket, &key, e))
    }

    async fn multipart_put_part(
        &self,
        ctx: RequestContext,
        node: Node,
        upload_id: String,
        part_number: u32,
        req: PutRequest,
    ) -> Result<PartInfo> {
        ctx.check_cancelled()?;
        let ds = branch_ds(&ctx, BranchKey::In)?;
        let key = object_key(&node)?;
        let md5 = req
            .md5
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(normalize_md5)
            .transpose()
            .map_err(|e| CoreError::InvalidArgument(format!("Content-MD5: {}", e)))?;
        let size = req.known_size();
        let hashing = HashingReader::new(req.reader)
            .with_md5(md5.clone())
            .with_sha256(req.sha256.clone())
            .with_size(size);
        let probe = hashing.probe();
        let opts = PutOptions {
            md5,
            sha256: req.sha256,
            ..Default::default()
        };
        ds.client
            .put_object_part(&ds.bucket, &key, &upload_id, part_number, Box::pin(hashing), size, opts)
            .await
            .map_err(|err| match probe.failure() {
                Some(integrity) => CoreError::Integrity(integrity),
                None => CoreError::backend(&ds.bucket, &key, err),
            })
    }
}
