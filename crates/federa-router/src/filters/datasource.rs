//! Data-source resolution from the selected root

use crate::filter::BranchResolver;
use async_trait::async_trait;
use federa_core::node::{join_path, split_first, strip_prefix_path, trim_path};
use federa_core::{BranchKey, ClientsPool, CoreError, Node, NodeAttr, RequestContext, Result};
use std::sync::Arc;
use tracing::debug;

/// Maps a root-relative path to `{client, bucket, datasource-path}`.
/// Admin paths start with the data-source name and are kept as they are.
pub struct PathDataSourceResolver {
    pool: Arc<ClientsPool>,
}

impl PathDataSourceResolver {
    pub fn new(pool: Arc<ClientsPool>) -> Self {
        Self { pool }
    }
}

fn admin_branch(ctx: &RequestContext, key: BranchKey) -> bool {
    ctx.branch(key)
        .and_then(|b| b.workspace.as_ref())
        .is_some_and(|ws| ws.is_admin_root())
}

#[async_trait]
impl BranchResolver for PathDataSourceResolver {
    async fn update_input(
        &self,
        mut ctx: RequestContext,
        key: BranchKey,
        mut node: Node,
    ) -> Result<(RequestContext, Node)> {
        if admin_branch(&ctx, key) {
            let path = trim_path(&node.path).to_string();
            let (ds_name, ds_path) = split_first(&path);
            if ds_name.is_empty() {
                return Ok((ctx, node));
            }
            let info = self.pool.get_data_source_info(ds_name)?;
            node.set_attr(NodeAttr::DataSourceName, ds_name);
            node.set_attr(NodeAttr::DataSourcePath, ds_path);
            node.path = path.clone();
            ctx.branch_mut(key).ds = Some(info);
            return Ok((ctx, node));
        }

        let Some(root) = ctx.branch(key).and_then(|b| b.root.clone()) else {
            return Ok((ctx, node));
        };
        let ds_name = root
            .attr(NodeAttr::DataSourceName)
            .ok_or_else(|| CoreError::DataSourceNotFound(format!("root {} has no data source", root.uuid)))?
            .to_string();
        let root_ds_path = root.attr(NodeAttr::DataSourcePath).unwrap_or_default();
        let rel = trim_path(&node.path).to_string();

        let info = self.pool.get_data_source_info(&ds_name)?;
        node.path = join_path(&root.path, &rel);
        node.set_attr(NodeAttr::DataSourcePath, join_path(root_ds_path, &rel));
        node.set_attr(NodeAttr::DataSourceName, ds_name.clone());
        debug!(ds = %ds_name, bucket = %info.bucket, path = %node.path, "Data source resolved");
        ctx.branch_mut(key).ds = Some(info);
        Ok((ctx, node))
    }

    fn update_output(&self, ctx: &RequestContext, key: BranchKey, mut node: Node) -> Result<Node> {
        if admin_branch(ctx, key) {
            return Ok(node);
        }
        let Some(root) = ctx.branch(key).and_then(|b| b.root.as_ref()) else {
            return Ok(node);
        };
        let rel = strip_prefix_path(&node.path, &root.path)
            .ok_or_else(|| CoreError::NodeNotFound(format!("{} lies outside {}", node.path, root.path)))?
            .to_string();
        node.path = rel;
        Ok(node)
    }

    async fn read_virtual(&self, ctx: &RequestContext, node: &Node) -> Result<Option<Node>> {
        if admin_branch(ctx, BranchKey::In) && node.uuid.is_empty() && trim_path(&node.path).is_empty() {
            return Ok(Some(Node::collection("")));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::env;
    use federa_core::{Principal, Workspace};

    #[tokio::test]
    async fn test_root_relative_path_is_mapped() {
        let env = env(&[("ds1", false)]).await;
        let root = env.root("ds1/home/alice", "r1");
        let mut ctx = env.ctx(Principal::user("u1", "alice"), Vec::new());
        ctx.branch_mut(BranchKey::In).root = Some(root);

        let resolver = PathDataSourceResolver::new(env.pool.clone());
        let (ctx, node) = resolver
            .update_input(ctx, BranchKey::In, Node::leaf("photos/p.jpg"))
            .await
            .unwrap();
        assert_eq!(node.path, "ds1/home/alice/photos/p.jpg");
        assert_eq!(node.attr(NodeAttr::DataSourceName), Some("ds1"));
        assert_eq!(node.attr(NodeAttr::DataSourcePath), Some("home/alice/photos/p.jpg"));
        assert_eq!(ctx.ds(BranchKey::In).unwrap().bucket, "ds1");

        let out = resolver.update_output(&ctx, BranchKey::In, node).unwrap();
        assert_eq!(out.path, "photos/p.jpg");
        let outside = resolver.update_output(&ctx, BranchKey::In, Node::leaf("ds1/home/bob/x"));
        assert!(outside.is_err());
    }

    #[tokio::test]
    async fn test_admin_path_names_the_source() {
        let env = env(&[("ds1", false)]).await;
        let mut ctx = env.ctx(Principal::admin("root"), Vec::new());
        ctx.branch_mut(BranchKey::In).workspace = Some(Workspace::admin_root());

        let resolver = PathDataSourceResolver::new(env.pool.clone());
        let (ctx, node) = resolver
            .update_input(ctx, BranchKey::In, Node::leaf("/ds1/a/b"))
            .await
            .unwrap();
        assert_eq!(node.path, "ds1/a/b");
        assert_eq!(node.attr(NodeAttr::DataSourcePath), Some("a/b"));
        assert!(ctx.ds(BranchKey::In).is_some());

        let root = resolver.read_virtual(&ctx, &Node::collection("")).await.unwrap();
        assert!(root.is_some());
    }

    #[tokio::test]
    async fn test_unknown_source() {
        let env = env(&[]).await;
        let mut ctx = env.ctx(Principal::admin("root"), Vec::new());
        ctx.branch_mut(BranchKey::In).workspace = Some(Workspace::admin_root());
        let err = PathDataSourceResolver::new(env.pool.clone())
            .update_input(ctx, BranchKey::In, Node::leaf("nope/x"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::DataSourceNotFound(_)));
    }
}
