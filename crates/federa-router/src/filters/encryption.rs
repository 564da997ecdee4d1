//! Attaches data keys to requests on encrypted data sources

use crate::filter::{Filter, Next};
use crate::handler::{CopyRequest, GetRequest, Handler, MultipartCreateRequest, PutRequest};
use async_trait::async_trait;
use federa_core::{BranchKey, CoreError, KeyService, Node, RequestContext, Result};
use federa_crypto::DekKey;
use federa_objects::{CompletePart, ObjectInfo, ObjectReader, PartInfo};
use std::sync::Arc;
use tracing::debug;

pub struct EncryptionFilter {
    keys: Arc<dyn KeyService>,
}

impl EncryptionFilter {
    pub fn new(keys: Arc<dyn KeyService>) -> Self {
        Self { keys }
    }

    /// Key of `node` when its branch resolved to an encrypted source
    async fn key_for(
        &self,
        ctx: &RequestContext,
        key: BranchKey,
        node: &Node,
        create: bool,
    ) -> Result<Option<DekKey>> {
        match ctx.ds(key) {
            Some(ds) if ds.encrypted => {
                debug!(ds = %ds.name, path = %node.path, create, "Fetching data key");
                Ok(Some(self.keys.get_encryption_key(node, create).await?))
            }
            _ => Ok(None),
        }
    }

    fn reject_multipart(ctx: &RequestContext) -> Result<()> {
        match ctx.ds(BranchKey::In) {
            Some(ds) if ds.encrypted => Err(CoreError::NotImplemented(format!(
                "multipart upload on encrypted data source {}",
                ds.name
            ))),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Filter for EncryptionFilter {
    fn name(&self) -> &'static str {
        "encryption"
    }

    async fn get_object(
        &self,
        ctx: RequestContext,
        node: Node,
        mut req: GetRequest,
        next: Next,
    ) -> Result<ObjectReader> {
        req.encryption_key = self.key_for(&ctx, BranchKey::In, &node, false).await?;
        next.get_object(ctx, node, req).await
    }

    async fn put_object(
        &self,
        ctx: RequestContext,
        node: Node,
        mut req: PutRequest,
        next: Next,
    ) -> Result<ObjectInfo> {
        if !node.is_marker() {
            req.encryption_key = self.key_for(&ctx, BranchKey::In, &node, true).await?;
        }
        next.put_object(ctx, node, req).await
    }

    async fn copy_object(
        &self,
        ctx: RequestContext,
        from: Node,
        to: Node,
        mut req: CopyRequest,
        next: Next,
    ) -> Result<ObjectInfo> {
        req.src_encryption_key = self.key_for(&ctx, BranchKey::From, &from, false).await?;
        req.dest_encryption_key = self.key_for(&ctx, BranchKey::To, &to, true).await?;
        next.copy_object(ctx, from, to, req).await
    }

    async fn multipart_create(
        &self,
        ctx: RequestContext,
        node: Node,
        req: MultipartCreateRequest,
        next: Next,
    ) -> Result<String> {
        Self::reject_multipart(&ctx)?;
        next.multipart_create(ctx, node, req).await
    }

    async fn multipart_complete(
        &self,
        ctx: RequestContext,
        node: Node,
        upload_id: String,
        parts: Vec<CompletePart>,
        next: Next,
    ) -> Result<ObjectInfo> {
        Self::reject_multipart(&ctx)?;
        next.multipart_complete(ctx, node, upload_id, parts).await
    }

    async fn multipart_put_part(
        &self,
        ctx: RequestContext,
        node: Node,
        upload_id: String,
        part_number: u32,
        req: PutRequest,
        next: Next,
    ) -> Result<PartInfo> {
        Self::reject_multipart(&ctx)?;
        next.multipart_put_part(ctx, node, upload_id, part_number, req)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Executor;
    use crate::filter::Chain;
    use crate::testing::{ds_node, env};
    use federa_core::MemoryKeyService;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_encrypted_source_stores_ciphertext() {
        let env = env(&[("secure", true)]).await;
        let keys = Arc::new(MemoryKeyService::new());
        let next = Chain::new(vec![Arc::new(EncryptionFilter::new(keys.clone()))], Arc::new(Executor)).head();
        let ctx = env.bound_ctx("secure");

        next.put_object(ctx.clone(), ds_node("secure", "a.txt"), PutRequest::from_bytes("top secret"))
            .await
            .unwrap();
        assert_eq!(keys.len(), 1);
        let stored = env.store("secure").object_bytes("secure", "a.txt").unwrap();
        assert!(!stored.windows(6).any(|w| w == b"secret"));

        let mut reader = next
            .get_object(ctx, ds_node("secure", "a.txt"), GetRequest::range(4, 6))
            .await
            .unwrap();
        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "secret");
    }

    #[tokio::test]
    async fn test_plain_source_untouched() {
        let env = env(&[("plain", false)]).await;
        let keys = Arc::new(MemoryKeyService::new());
        let next = Chain::new(vec![Arc::new(EncryptionFilter::new(keys.clone()))], Arc::new(Executor)).head();
        next.put_object(env.bound_ctx("plain"), ds_node("plain", "a.txt"), PutRequest::from_bytes("hello"))
            .await
            .unwrap();
        assert!(keys.is_empty());
        assert_eq!(env.store("plain").object_bytes("plain", "a.txt").unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_multipart_rejected_on_encrypted_source() {
        let env = env(&[("secure", true)]).await;
        let next = Chain::new(
            vec![Arc::new(EncryptionFilter::new(Arc::new(MemoryKeyService::new())))],
            Arc::new(Executor),
        )
        .head();
        let err = next
            .multipart_create(env.bound_ctx("secure"), ds_node("secure", "big"), MultipartCreateRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.s3_code().as_str(), "NotImplemented");
    }
}
