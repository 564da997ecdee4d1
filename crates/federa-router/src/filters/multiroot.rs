//! Root selection inside workspaces and the shared root cache

use crate::filter::BranchResolver;
use async_trait::async_trait;
use federa_core::node::{join_path, split_first, trim_path};
use federa_core::{root_key, BranchKey, CoreError, Node, NodeAttr, RequestContext, Result, Workspace};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Root nodes by identifier, filled from the tree on first use.
/// Concurrent misses may both query the tree; the last write wins.
#[derive(Default)]
pub struct RootCache {
    roots: RwLock<HashMap<String, Node>>,
}

impl RootCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load(&self, ctx: &RequestContext, uuid: &str) -> Result<Node> {
        if let Some(root) = self.roots.read().get(uuid) {
            return Ok(root.clone());
        }
        let root = ctx.tree()?.read_node(&Node::with_id(uuid)).await?;
        self.roots.write().insert(uuid.to_string(), root.clone());
        Ok(root)
    }

    /// Load every root of `workspace`, in declared order
    pub async fn load_all(&self, ctx: &RequestContext, workspace: &Workspace) -> Result<Vec<Node>> {
        let mut roots = Vec::with_capacity(workspace.root_uuids.len());
        for uuid in &workspace.root_uuids {
            roots.push(self.load(ctx, uuid).await?);
        }
        Ok(roots)
    }

    pub fn invalidate(&self, uuid: &str) {
        self.roots.write().remove(uuid);
    }

    pub fn invalidate_all(&self) {
        self.roots.write().clear();
    }

    pub fn len(&self) -> usize {
        self.roots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn matches_root(root: &Node, segment: &str) -> bool {
    !segment.is_empty() && (root_key(root) == segment || root.uuid == segment)
}

/// Picks the root a path lives under. Single-root workspaces attach their
/// root; multi-root workspaces consume a root-key segment.
pub struct MultiRootResolver {
    cache: Arc<RootCache>,
}

impl MultiRootResolver {
    pub fn new(cache: Arc<RootCache>) -> Self {
        Self { cache }
    }

    fn workspace(ctx: &RequestContext, key: BranchKey) -> Option<Workspace> {
        ctx.branch(key)
            .and_then(|b| b.workspace.clone())
            .filter(|ws| !ws.is_admin_root())
    }
}

#[async_trait]
impl BranchResolver for MultiRootResolver {
    async fn update_input(
        &self,
        mut ctx: RequestContext,
        key: BranchKey,
        mut node: Node,
    ) -> Result<(RequestContext, Node)> {
        let Some(workspace) = Self::workspace(&ctx, key) else {
            return Ok((ctx, node));
        };

        let root = match workspace.root_uuids.as_slice() {
            [] => {
                return Err(CoreError::NodeNotFound(format!(
                    "workspace {} has no root",
                    workspace.slug
                )))
            }
            [single] => self.cache.load(&ctx, single).await?,
            _ => {
                let path = trim_path(&node.path).to_string();
                let (segment, rest) = split_first(&path);
                let roots = self.cache.load_all(&ctx, &workspace).await?;
                let root = roots
                    .into_iter()
                    .find(|root| matches_root(root, segment))
                    .ok_or_else(|| {
                        CoreError::NodeNotFound(format!("no root {} in {}", segment, workspace.slug))
                    })?;
                node.path = rest.to_string();
                root
            }
        };
        debug!(root = %root.uuid, path = %root.path, "Root selected");
        ctx.branch_mut(key).root = Some(root);
        Ok((ctx, node))
    }

    fn update_output(&self, ctx: &RequestContext, key: BranchKey, mut node: Node) -> Result<Node> {
        let Some(branch) = ctx.branch(key) else {
            return Ok(node);
        };
        let multi = branch
            .workspace
            .as_ref()
            .is_some_and(|ws| ws.has_multiple_roots());
        if let (true, Some(root)) = (multi, branch.root.as_ref()) {
            node.path = join_path(&root_key(root), &node.path);
        }
        Ok(node)
    }

    async fn list_virtual(&self, ctx: &RequestContext, node: &Node) -> Result<Option<Vec<Node>>> {
        let Some(workspace) = Self::workspace(ctx, BranchKey::In) else {
            return Ok(None);
        };
        if !workspace.has_multiple_roots() || !node.uuid.is_empty() {
            return Ok(None);
        }
        let (segment, _) = split_first(&node.path);
        let roots = self.cache.load_all(ctx, &workspace).await?;
        if roots.iter().any(|root| matches_root(root, segment)) {
            return Ok(None);
        }
        Ok(Some(
            roots
                .iter()
                .map(|root| {
                    Node::collection(root_key(root))
                        .uuid(root.uuid.clone())
                        .mtime(root.mtime)
                        .with_attr(NodeAttr::Name, federa_core::node::base_name(&root.path))
                })
                .collect(),
        ))
    }

    async fn read_virtual(&self, ctx: &RequestContext, node: &Node) -> Result<Option<Node>> {
        let multi = Self::workspace(ctx, BranchKey::In).is_some_and(|ws| ws.has_multiple_roots());
        if multi && node.uuid.is_empty() && trim_path(&node.path).is_empty() {
            return Ok(Some(Node::collection("")));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::env;
    use federa_core::Principal;

    #[tokio::test]
    async fn test_single_root_is_attached() {
        let env = env(&[]).await;
        let root = env.root("ds1/home/alice", "root-alice");
        let ws = Workspace::new("ws", "alice").with_roots(["root-alice"]);
        let mut ctx = env.ctx(Principal::user("u1", "alice"), vec![ws.clone()]);
        ctx.branch_mut(BranchKey::In).workspace = Some(ws);

        let resolver = MultiRootResolver::new(Arc::new(RootCache::new()));
        let (ctx, node) = resolver
            .update_input(ctx, BranchKey::In, Node::leaf("docs/a"))
            .await
            .unwrap();
        assert_eq!(node.path, "docs/a");
        assert_eq!(ctx.branch(BranchKey::In).unwrap().root.as_ref(), Some(&root));
        assert_eq!(resolver.update_output(&ctx, BranchKey::In, node).unwrap().path, "docs/a");
    }

    #[tokio::test]
    async fn test_root_key_selects_and_restores() {
        let env = env(&[]).await;
        env.root("ds1/docs", "abcdef123");
        env.root("ds2/media", "987654fed");
        let ws = Workspace::new("ws", "pub").with_roots(["abcdef123", "987654fed"]);
        let mut ctx = env.ctx(Principal::user("u1", "alice"), vec![ws.clone()]);
        ctx.branch_mut(BranchKey::In).workspace = Some(ws);

        let resolver = MultiRootResolver::new(Arc::new(RootCache::new()));
        let (ctx, node) = resolver
            .update_input(ctx, BranchKey::In, Node::leaf("abcdef-docs/readme.md"))
            .await
            .unwrap();
        assert_eq!(node.path, "readme.md");
        assert_eq!(ctx.branch(BranchKey::In).unwrap().root.as_ref().unwrap().uuid, "abcdef123");
        let out = resolver.update_output(&ctx, BranchKey::In, node).unwrap();
        assert_eq!(out.path, "abcdef-docs/readme.md");

        // raw identifiers are accepted too
        let mut ctx = ctx;
        let ws = ctx.branch(BranchKey::In).unwrap().workspace.clone();
        ctx.branch_mut(BranchKey::From).workspace = ws;
        let (ctx, node) = resolver
            .update_input(ctx, BranchKey::From, Node::leaf("987654fed/x"))
            .await
            .unwrap();
        assert_eq!(node.path, "x");
        assert_eq!(ctx.branch(BranchKey::From).unwrap().root.as_ref().unwrap().uuid, "987654fed");
    }

    #[tokio::test]
    async fn test_roots_listed_when_segment_unknown() {
        let env = env(&[]).await;
        env.root("ds1/docs", "abcdef123");
        env.root("ds2/media", "987654fed");
        let ws = Workspace::new("ws", "pub").with_roots(["abcdef123", "987654fed"]);
        let mut ctx = env.ctx(Principal::user("u1", "alice"), vec![ws.clone()]);
        ctx.branch_mut(BranchKey::In).workspace = Some(ws);

        let resolver = MultiRootResolver::new(Arc::new(RootCache::new()));
        let listed = resolver
            .list_virtual(&ctx, &Node::collection(""))
            .await
            .unwrap()
            .unwrap();
        let keys: Vec<_> = listed.iter().map(|n| n.path.clone()).collect();
        assert_eq!(keys, vec!["abcdef-docs", "987654-media"]);
        assert!(resolver
            .list_virtual(&ctx, &Node::collection("abcdef-docs"))
            .await
            .unwrap()
            .is_none());

        let err = resolver
            .update_input(ctx, BranchKey::In, Node::leaf("zzz/x"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
