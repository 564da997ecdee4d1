//! Workspace resolution: the first path segment selects one of the
//! principal's workspaces.

use crate::filter::BranchResolver;
use async_trait::async_trait;
use federa_core::node::{join_path, split_first, trim_path};
use federa_core::{
    BranchKey, CoreError, Node, NodeAttr, RequestContext, Result, Workspace,
};
use tracing::debug;

#[derive(Debug, Default, Clone, Copy)]
pub struct WorkspaceResolver;

impl WorkspaceResolver {
    pub fn new() -> Self {
        Self
    }
}

fn is_top(node: &Node) -> bool {
    node.uuid.is_empty() && trim_path(&node.path).is_empty()
}

fn authenticated(ctx: &RequestContext) -> Result<()> {
    match ctx.principal() {
        Some(_) => Ok(()),
        None => Err(CoreError::Forbidden("authentication required".into())),
    }
}

#[async_trait]
impl BranchResolver for WorkspaceResolver {
    async fn update_input(
        &self,
        mut ctx: RequestContext,
        key: BranchKey,
        mut node: Node,
    ) -> Result<(RequestContext, Node)> {
        authenticated(&ctx)?;
        if ctx.is_admin() {
            ctx.branch_mut(key).workspace = Some(Workspace::admin_root());
            return Ok((ctx, node));
        }

        let path = trim_path(&node.path).to_string();
        let (slug, rest) = split_first(&path);
        let workspace = ctx
            .workspaces()
            .and_then(|all| all.iter().find(|ws| ws.slug == slug))
            .cloned()
            .ok_or_else(|| CoreError::WorkspaceNotFound(slug.to_string()))?;
        debug!(slug, workspace = %workspace.uuid, "Workspace matched");

        node.path = rest.to_string();
        ctx.branch_mut(key).workspace = Some(workspace);
        Ok((ctx, node))
    }

    fn update_output(&self, ctx: &RequestContext, key: BranchKey, mut node: Node) -> Result<Node> {
        if let Some(ws) = ctx.branch(key).and_then(|b| b.workspace.as_ref()) {
            if !ws.is_admin_root() {
                node.path = join_path(&ws.slug, &node.path);
            }
        }
        Ok(node)
    }

    async fn list_virtual(&self, ctx: &RequestContext, node: &Node) -> Result<Option<Vec<Node>>> {
        if !is_top(node) || ctx.is_admin() {
            return Ok(None);
        }
        authenticated(ctx)?;
        let nodes = ctx
            .workspaces()
            .unwrap_or_default()
            .iter()
            .map(|ws| {
                Node::collection(ws.slug.clone())
                    .uuid(ws.uuid.clone())
                    .with_attr(NodeAttr::Name, ws.label.clone())
            })
            .collect();
        Ok(Some(nodes))
    }

    async fn read_virtual(&self, ctx: &RequestContext, node: &Node) -> Result<Option<Node>> {
        if !is_top(node) || ctx.is_admin() {
            return Ok(None);
        }
        Ok(Some(Node::collection("")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use federa_core::Principal;

    fn ctx(principal: Principal) -> RequestContext {
        let mut ctx = RequestContext::new().with_principal(principal);
        ctx.set_workspaces(vec![
            Workspace::new("ws-1", "alice").with_label("Alice"),
            Workspace::new("ws-2", "shared"),
        ]);
        ctx
    }

    #[tokio::test]
    async fn test_slug_is_stripped_and_restored() {
        let resolver = WorkspaceResolver;
        let (ctx, node) = resolver
            .update_input(ctx(Principal::user("u1", "alice")), BranchKey::In, Node::leaf("/alice/docs/a.txt"))
            .await
            .unwrap();
        assert_eq!(node.path, "docs/a.txt");
        let ws = ctx.branch(BranchKey::In).and_then(|b| b.workspace.clone()).unwrap();
        assert_eq!(ws.uuid, "ws-1");

        let out = resolver.update_output(&ctx, BranchKey::In, node).unwrap();
        assert_eq!(out.path, "alice/docs/a.txt");
    }

    #[tokio::test]
    async fn test_unknown_slug() {
        let err = WorkspaceResolver
            .update_input(ctx(Principal::user("u1", "alice")), BranchKey::In, Node::leaf("bob/x"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::WorkspaceNotFound(_)));
    }

    #[tokio::test]
    async fn test_admin_keeps_path() {
        let (ctx, node) = WorkspaceResolver
            .update_input(ctx(Principal::admin("root")), BranchKey::In, Node::leaf("ds1/x"))
            .await
            .unwrap();
        assert_eq!(node.path, "ds1/x");
        let out = WorkspaceResolver.update_output(&ctx, BranchKey::In, node).unwrap();
        assert_eq!(out.path, "ds1/x");
    }

    #[tokio::test]
    async fn test_root_lists_workspaces() {
        let ctx = ctx(Principal::user("u1", "alice"));
        let listed = WorkspaceResolver
            .list_virtual(&ctx, &Node::collection(""))
            .await
            .unwrap()
            .unwrap();
        let slugs: Vec<_> = listed.iter().map(|n| n.path.as_str()).collect();
        assert_eq!(slugs, vec!["alice", "shared"]);
        assert_eq!(listed[0].attr(NodeAttr::Name), Some("Alice"));

        let root = WorkspaceResolver.read_virtual(&ctx, &Node::leaf("/")).await.unwrap();
        assert_eq!(root.map(|n| n.path), Some(String::new()));
        assert!(WorkspaceResolver
            .list_virtual(&ctx, &Node::collection("alice"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_anonymous_is_rejected() {
        let err = WorkspaceResolver
            .update_input(RequestContext::new(), BranchKey::In, Node::leaf("alice/x"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Forbidden(_)));
    }
}
