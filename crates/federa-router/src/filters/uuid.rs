//! Identifier-based resolution, used by the by-uuid chain.
//!
//! Nodes are addressed as `<slug>:<uuid>`. The index supplies the physical
//! location, so there is no path rewriting on the way down.

use super::multiroot::RootCache;
use crate::filter::BranchResolver;
use async_trait::async_trait;
use federa_core::node::{join_path, strip_prefix_path};
use federa_core::{
    root_key, BranchKey, ClientsPool, CoreError, Node, NodeAttr, RequestContext, Result, Workspace,
    ROOT_WORKSPACE,
};
use std::sync::Arc;
use tracing::debug;

/// Splits `<slug>:<uuid>`, resolves the workspace and the root holding the node
pub struct UuidWorkspaceResolver {
    cache: Arc<RootCache>,
}

impl UuidWorkspaceResolver {
    pub fn new(cache: Arc<RootCache>) -> Self {
        Self { cache }
    }

    fn workspace(ctx: &RequestContext, slug: &str) -> Result<Workspace> {
        if ctx.is_admin() && (slug.is_empty() || slug == ROOT_WORKSPACE) {
            return Ok(Workspace::admin_root());
        }
        ctx.workspaces()
            .and_then(|all| all.iter().find(|ws| ws.slug == slug))
            .cloned()
            .ok_or_else(|| CoreError::WorkspaceNotFound(slug.to_string()))
    }
}

#[async_trait]
impl BranchResolver for UuidWorkspaceResolver {
    async fn update_input(
        &self,
        mut ctx: RequestContext,
        key: BranchKey,
        node: Node,
    ) -> Result<(RequestContext, Node)> {
        if ctx.principal().is_none() {
            return Err(CoreError::Forbidden("authentication required".into()));
        }
        let (slug, uuid) = match node.uuid.split_once(':') {
            Some((slug, uuid)) => (slug.to_string(), uuid.to_string()),
            None if ctx.is_admin() => (ROOT_WORKSPACE.to_string(), node.uuid.clone()),
            None => {
                return Err(CoreError::InvalidArgument(format!(
                    "expected <workspace>:<uuid>, got {}",
                    node.uuid
                )))
            }
        };
        let workspace = Self::workspace(&ctx, &slug)?;
        let indexed = ctx.tree()?.read_node(&Node::with_id(uuid.clone())).await?;

        if !workspace.is_admin_root() {
            let roots = self.cache.load_all(&ctx, &workspace).await?;
            let root = roots
                .into_iter()
                .find(|root| strip_prefix_path(&indexed.path, &root.path).is_some())
                .ok_or_else(|| CoreError::Forbidden(format!("{} is outside workspace {}", uuid, slug)))?;
            debug!(uuid = %uuid, root = %root.uuid, "Node located in workspace");
            ctx.branch_mut(key).root = Some(root);
        }
        ctx.branch_mut(key).workspace = Some(workspace);

        let mut resolved = indexed;
        if let Some(version) = node.attr(NodeAttr::VersionId) {
            resolved.set_attr(NodeAttr::VersionId, version);
        }
        resolved.meta.headers.extend(node.meta.headers);
        Ok((ctx, resolved))
    }

    fn update_output(&self, ctx: &RequestContext, key: BranchKey, mut node: Node) -> Result<Node> {
        let Some(branch) = ctx.branch(key) else {
            return Ok(node);
        };
        let Some(workspace) = branch.workspace.as_ref() else {
            return Ok(node);
        };
        if !node.uuid.is_empty() && !node.uuid.contains(':') {
            node.uuid = format!("{}:{}", workspace.slug, node.uuid);
        }
        if workspace.is_admin_root() {
            return Ok(node);
        }
        if let Some(root) = branch.root.as_ref() {
            let rel = strip_prefix_path(&node.path, &root.path)
                .ok_or_else(|| CoreError::NodeNotFound(format!("{} lies outside {}", node.path, root.path)))?;
            let rel = if workspace.has_multiple_roots() {
                join_path(&root_key(root), rel)
            } else {
                rel.to_string()
            };
            node.path = join_path(&workspace.slug, &rel);
        }
        Ok(node)
    }
}

/// Fills the data source from the node's own location attributes
pub struct UuidDataSourceResolver {
    pool: Arc<ClientsPool>,
}

impl UuidDataSourceResolver {
    pub fn new(pool: Arc<ClientsPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BranchResolver for UuidDataSourceResolver {
    async fn update_input(
        &self,
        mut ctx: RequestContext,
        key: BranchKey,
        mut node: Node,
    ) -> Result<(RequestContext, Node)> {
        if node.attr(NodeAttr::DataSourceName).is_none() {
            let indexed = ctx.tree()?.read_node(&node).await?;
            for attr in [NodeAttr::DataSourceName, NodeAttr::DataSourcePath] {
                if let Some(value) = indexed.attr(attr) {
                    node.set_attr(attr, value);
                }
            }
        }
        let ds_name = node
            .attr(NodeAttr::DataSourceName)
            .ok_or_else(|| CoreError::DataSourceNotFound(format!("{} has no data source", node.uuid)))?;
        ctx.branch_mut(key).ds = Some(self.pool.get_data_source_info(ds_name)?);
        Ok((ctx, node))
    }

    fn update_output(&self, _ctx: &RequestContext, _key: BranchKey, node: Node) -> Result<Node> {
        Ok(node)
    }
}
