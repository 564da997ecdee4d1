//! Index pre-reservation around uploads

use crate::filter::{Filter, Next};
use crate::handler::{Handler, PutRequest};
use async_trait::async_trait;
use chrono::Utc;
use federa_core::{BranchKey, Node, RequestContext, Result, META_NODE_UUID};
use federa_objects::ObjectInfo;
use tracing::{debug, instrument, warn};

/// Etag of a reservation not yet confirmed by an upload
pub const TEMPORARY_ETAG: &str = "temporary";

/// Gives every upload a node identifier before bytes move. A leaf reserved
/// here is deleted again when the upload fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct PutFilter;

impl PutFilter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Filter for PutFilter {
    fn name(&self) -> &'static str {
        "put"
    }

    #[instrument(skip_all, fields(path = %node.path))]
    async fn put_object(
        &self,
        ctx: RequestContext,
        mut node: Node,
        mut req: PutRequest,
        next: Next,
    ) -> Result<ObjectInfo> {
        let binary = ctx.branch(BranchKey::In).is_some_and(|b| b.binary);
        if node.is_marker() || binary {
            return next.put_object(ctx, node, req).await;
        }
        if !node.uuid.is_empty() {
            req.metadata.insert(META_NODE_UUID.to_string(), node.uuid.clone());
            return next.put_object(ctx, node, req).await;
        }

        let tree = ctx.tree()?;
        let (uuid, reserved) = match tree.read_node(&Node::leaf(node.path.clone())).await {
            Ok(existing) => (existing.uuid, None),
            Err(err) if err.is_not_found() => {
                let placeholder = Node::leaf(node.path.clone())
                    .size(req.size.max(0))
                    .mtime(if node.mtime > 0 { node.mtime } else { Utc::now().timestamp() })
                    .etag(TEMPORARY_ETAG);
                let created = tree.create_node(placeholder).await?;
                debug!(uuid = %created.uuid, "Reserved index entry");
                (created.uuid.clone(), Some(created))
            }
            Err(err) => return Err(err),
        };

        req.metadata.insert(META_NODE_UUID.to_string(), uuid.clone());
        node.uuid = uuid;
        let result = next.put_object(ctx, node, req).await;
        if let (Err(err), Some(created)) = (&result, reserved) {
            warn!(uuid = %created.uuid, error = %err, "Upload failed, dropping reservation");
            if let Err(e) = tree.delete_node(&created).await {
                warn!(uuid = %created.uuid, error = %e, "Failed to drop reservation");
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Executor;
    use crate::filter::Chain;
    use crate::testing::{ds_node, env};
    use federa_core::TreeClient;
    use federa_crypto::md5_hash;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_new_upload_carries_reserved_uuid() {
        let env = env(&[("ds1", false)]).await;
        let next = Chain::new(vec![Arc::new(PutFilter)], Arc::new(Executor)).head();
        next.put_object(env.bound_ctx("ds1"), ds_node("ds1", "a.txt"), PutRequest::from_bytes("hello"))
            .await
            .unwrap();

        let reserved = env.tree.get("ds1/a.txt").unwrap();
        assert_eq!(reserved.etag, TEMPORARY_ETAG);
        let stat = env.store("ds1");
        let info = federa_objects::ObjectBackend::stat_object(&stat, "ds1", "a.txt").await.unwrap();
        assert_eq!(federa_objects::meta_get(&info.metadata, META_NODE_UUID), Some(reserved.uuid.as_str()));
    }

    #[tokio::test]
    async fn test_existing_node_uuid_is_reused() {
        let env = env(&[("ds1", false)]).await;
        let existing = env.tree.upsert_leaf("ds1/a.txt", Some("known"), 1, "e", 1);
        let next = Chain::new(vec![Arc::new(PutFilter)], Arc::new(Executor)).head();
        next.put_object(env.bound_ctx("ds1"), ds_node("ds1", "a.txt"), PutRequest::from_bytes("x"))
            .await
            .unwrap();
        assert_eq!(env.tree.get("ds1/a.txt").unwrap().uuid, existing.uuid);
        assert_eq!(env.tree.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_upload_drops_reservation() {
        let env = env(&[("ds1", false)]).await;
        let next = Chain::new(vec![Arc::new(PutFilter)], Arc::new(Executor)).head();
        let err = next
            .put_object(
                env.bound_ctx("ds1"),
                ds_node("ds1", "bad.txt"),
                PutRequest::from_bytes("payload").with_md5(md5_hash(b"different")),
            )
            .await
            .unwrap_err();
        assert_eq!(err.s3_code().as_str(), "BadDigest");
        assert!(env.tree.read_node(&Node::leaf("ds1/bad.txt")).await.is_err());
    }

    #[tokio::test]
    async fn test_broken_stream_drops_reservation() {
        let env = env(&[("ds1", false)]).await;
        let reader = tokio_test::io::Builder::new()
            .read(b"partial")
            .read_error(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "client gone"))
            .build();
        let next = Chain::new(vec![Arc::new(PutFilter)], Arc::new(Executor)).head();
        let result = next
            .put_object(env.bound_ctx("ds1"), ds_node("ds1", "cut.bin"), PutRequest::new(Box::pin(reader), 100))
            .await;
        assert!(result.is_err());
        assert!(env.tree.get("ds1/cut.bin").is_none());
    }
}
