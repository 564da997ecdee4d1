//! Version listing and redirection of versioned reads

use crate::filter::{Filter, Next};
use crate::handler::{CopyRequest, GetRequest, Handler};
use async_trait::async_trait;
use federa_core::{
    node_channel, BranchKey, ClientsPool, ListNodesRequest, Node, NodeAttr, NodeStream,
    RequestContext, Result, VersionRecord, ALIAS_VERSIONS, DEFAULT_STREAM_CAPACITY,
};
use federa_objects::{ObjectInfo, ObjectReader};
use std::sync::Arc;
use tracing::debug;

pub struct VersionFilter {
    pool: Arc<ClientsPool>,
}

fn overlay(mut node: Node, record: VersionRecord) -> Node {
    node.etag = record.etag;
    node.mtime = record.mtime;
    node.size = record.size;
    node.set_attr(NodeAttr::VersionId, record.version_id);
    node
}

impl VersionFilter {
    pub fn new(pool: Arc<ClientsPool>) -> Self {
        Self { pool }
    }

    /// Point `key` at the stored copy `<uuid>__<version>` in the versions source.
    /// Returns whether that source is encrypted.
    async fn rebind(
        &self,
        ctx: &mut RequestContext,
        key: BranchKey,
        node: &mut Node,
        version_id: &str,
    ) -> Result<bool> {
        if node.uuid.is_empty() {
            node.uuid = ctx.tree()?.read_node(node).await?.uuid;
        }
        let ds = self.pool.get_data_source_info(ALIAS_VERSIONS)?;
        let object = format!("{}__{}", node.uuid, version_id);
        debug!(ds = %ds.name, object = %object, "Redirecting to stored version");
        node.set_attr(NodeAttr::DataSourceName, ds.name.clone());
        node.set_attr(NodeAttr::DataSourcePath, object);
        let encrypted = ds.encrypted;
        ctx.branch_mut(key).ds = Some(ds);
        Ok(encrypted)
    }
}

#[async_trait]
impl Filter for VersionFilter {
    fn name(&self) -> &'static str {
        "version"
    }

    async fn read_node(&self, ctx: RequestContext, node: Node, next: Next) -> Result<Node> {
        let Some(version_id) = node.attr(NodeAttr::VersionId).map(str::to_string) else {
            return next.read_node(ctx, node).await;
        };
        let versions = ctx.versions()?;
        let current = next.read_node(ctx, node).await?;
        let record = versions.head_version(&current, &version_id).await?;
        Ok(overlay(current, record))
    }

    async fn list_nodes(&self, ctx: RequestContext, req: ListNodesRequest, next: Next) -> Result<NodeStream> {
        if !req.versions {
            return next.list_nodes(ctx, req).await;
        }
        let versions = ctx.versions()?;
        let target = ctx.tree()?.read_node(&req.node).await?;
        let (tx, stream) = node_channel(DEFAULT_STREAM_CAPACITY, ctx.cancellation().clone());
        tokio::spawn(async move {
            match versions.list_versions(&target).await {
                Ok(records) => {
                    for record in records {
                        if tx.send(overlay(target.clone(), record)).await.is_err() {
                            return;
                        }
                    }
                }
                Err(err) => tx.fail(err).await,
            }
        });
        Ok(stream)
    }

    async fn get_object(
        &self,
        mut ctx: RequestContext,
        mut node: Node,
        mut req: GetRequest,
        next: Next,
    ) -> Result<ObjectReader> {
        if let Some(version_id) = req.version_id.take().filter(|v| !v.is_empty()) {
            let encrypted = self.rebind(&mut ctx, BranchKey::In, &mut node, &version_id).await?;
            if !encrypted {
                req.encryption_key = None;
            }
        }
        next.get_object(ctx, node, req).await
    }

    async fn copy_object(
        &self,
        mut ctx: RequestContext,
        mut from: Node,
        to: Node,
        mut req: CopyRequest,
        next: Next,
    ) -> Result<ObjectInfo> {
        if let Some(version_id) = req.src_version_id.take().filter(|v| !v.is_empty()) {
            let encrypted = self.rebind(&mut ctx, BranchKey::From, &mut from, &version_id).await?;
            if !encrypted {
                req.src_encryption_key = None;
            }
        }
        next.copy_object(ctx, from, to, req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Executor;
    use crate::handler::PutRequest;
    use crate::filter::Chain;
    use crate::testing::{ds_node, env};
    use tokio::io::AsyncReadExt;

    fn record(id: &str, size: i64) -> VersionRecord {
        VersionRecord {
            version_id: id.into(),
            mtime: 100 + size,
            size,
            etag: format!("etag-{}", id),
            description: String::new(),
        }
    }

    #[tokio::test]
    async fn test_versions_listing() {
        let env = env(&[("ds1", false)]).await;
        env.tree.upsert_leaf("ds1/a.txt", Some("n1"), 9, "cur", 1);
        for (id, size) in [("v1", 3), ("v2", 5), ("v3", 7)] {
            env.versions.add_version("n1", record(id, size));
        }
        let next = Chain::new(vec![Arc::new(VersionFilter::new(env.pool.clone()))], Arc::new(Executor)).head();

        let listed = next
            .list_nodes(env.bound_ctx("ds1"), ListNodesRequest::new(Node::leaf("ds1/a.txt")).versions(true))
            .await
            .unwrap()
            .collect_nodes()
            .await
            .unwrap();
        assert_eq!(listed.len(), 3);
        let ids: Vec<_> = listed.iter().filter_map(|n| n.attr(NodeAttr::VersionId)).collect();
        assert_eq!(ids, vec!["v1", "v2", "v3"]);
        assert_eq!(listed[1].size, 5);
        assert_eq!(listed[1].mtime, 105);
    }

    #[tokio::test]
    async fn test_read_node_overlays_version() {
        let env = env(&[("ds1", false)]).await;
        env.tree.upsert_leaf("ds1/a.txt", Some("n1"), 9, "cur", 1);
        env.versions.add_version("n1", record("v7", 4));
        let next = Chain::new(vec![Arc::new(VersionFilter::new(env.pool.clone()))], Arc::new(Executor)).head();

        let node = next
            .read_node(env.bound_ctx("ds1"), Node::leaf("ds1/a.txt").with_attr(NodeAttr::VersionId, "v7"))
            .await
            .unwrap();
        assert_eq!(node.size, 4);
        assert_eq!(node.etag, "etag-v7");
        assert_eq!(node.attr(NodeAttr::VersionId), Some("v7"));
    }

    #[tokio::test]
    async fn test_versioned_get_reads_versions_source() {
        let env = env(&[("ds1", false), ("vers", false)]).await;
        env.pool.register_alias(ALIAS_VERSIONS, "vers", None);
        env.tree.upsert_leaf("ds1/a.txt", Some("n1"), 3, "cur", 1);
        Executor
            .put_object(env.bound_ctx("vers"), ds_node("vers", "n1__v7"), PutRequest::from_bytes("old"))
            .await
            .unwrap();
        let next = Chain::new(vec![Arc::new(VersionFilter::new(env.pool.clone()))], Arc::new(Executor)).head();

        let mut reader = next
            .get_object(env.bound_ctx("ds1"), ds_node("ds1", "a.txt"), GetRequest::version("v7"))
            .await
            .unwrap();
        let mut body = String::new();
        reader.read_to_string(&mut body).await.unwrap();
        assert_eq!(body, "old");
    }
}
