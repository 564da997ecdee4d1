//! Authorization: policy check per operation, then the principal's
//! workspaces are loaded into the context.

use crate::filter::{BranchResolver, Filter, Next};
use crate::handler::{CopyRequest, GetRequest, Handler, MultipartCreateRequest, PutRequest};
use async_trait::async_trait;
use federa_core::{
    Action, BranchKey, CoreError, ListNodesRequest, Node, NodeStream, PolicyChecker, PolicyRequest,
    RequestContext, Result, WorkspaceProvider,
};
use federa_objects::{CompletePart, MultipartUploadInfo, ObjectInfo, ObjectReader, PartInfo};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Bucket name presented to the policy service
pub const DEFAULT_POLICY_BUCKET: &str = "io";

struct Authorizer {
    policy: Arc<dyn PolicyChecker>,
    workspaces: Arc<dyn WorkspaceProvider>,
    bucket: String,
}

impl Authorizer {
    async fn load_workspaces(&self, mut ctx: RequestContext) -> Result<RequestContext> {
        if ctx.workspaces().is_some() {
            return Ok(ctx);
        }
        let workspaces = match ctx.principal() {
            Some(principal) if !principal.is_anonymous() => {
                self.workspaces.workspaces_for(principal).await?
            }
            _ => Vec::new(),
        };
        ctx.set_workspaces(workspaces);
        Ok(ctx)
    }

    /// Requests without a principal are left to the later stages, which only
    /// serve them from anonymous-readable namespaces.
    #[instrument(skip(self, ctx), fields(request = %ctx.request_id()))]
    async fn authorize(&self, ctx: RequestContext, action: Action, object: &str) -> Result<RequestContext> {
        if let Some(principal) = ctx.principal().filter(|p| !p.is_anonymous()) {
            let request = PolicyRequest::new(action, self.bucket.clone(), object)
                .with_principal(Some(principal.clone()));
            if !self.policy.is_allowed(&request).await? {
                debug!(login = %principal.login, "Denied by policy");
                return Err(CoreError::Forbidden(format!("{} on {}", action, object)));
            }
        }
        self.load_workspaces(ctx).await
    }
}

#[async_trait]
impl BranchResolver for Authorizer {
    async fn update_input(
        &self,
        ctx: RequestContext,
        _key: BranchKey,
        node: Node,
    ) -> Result<(RequestContext, Node)> {
        Ok((self.load_workspaces(ctx).await?, node))
    }

    fn update_output(&self, _ctx: &RequestContext, _key: BranchKey, node: Node) -> Result<Node> {
        Ok(node)
    }
}

/// First stage of every chain
pub struct AuthFilter {
    inner: Arc<Authorizer>,
}

impl AuthFilter {
    /// `bucket` is the bucket name presented to the policy service
    pub fn new(
        policy: Arc<dyn PolicyChecker>,
        workspaces: Arc<dyn WorkspaceProvider>,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Authorizer {
                policy,
                workspaces,
                bucket: bucket.into(),
            }),
        }
    }
}

#[async_trait]
impl Filter for AuthFilter {
    fn name(&self) -> &'static str {
        "auth"
    }

    fn resolver(&self) -> Option<Arc<dyn BranchResolver>> {
        Some(self.inner.clone() as Arc<dyn BranchResolver>)
    }

    async fn read_node(&self, ctx: RequestContext, node: Node, next: Next) -> Result<Node> {
        let ctx = self.inner.authorize(ctx, Action::GetObject, &node.path).await?;
        next.read_node(ctx, node).await
    }

    async fn list_nodes(&self, ctx: RequestContext, req: ListNodesRequest, next: Next) -> Result<NodeStream> {
        let ctx = self.inner.authorize(ctx, Action::ListBucket, &req.node.path).await?;
        next.list_nodes(ctx, req).await
    }

    async fn create_node(&self, ctx: RequestContext, node: Node, next: Next) -> Result<Node> {
        let ctx = self.inner.authorize(ctx, Action::PutObject, &node.path).await?;
        next.create_node(ctx, node).await
    }

    async fn update_node(&self, ctx: RequestContext, from: Node, to: Node, next: Next) -> Result<Node> {
        let ctx = self.inner.authorize(ctx, Action::DeleteObject, &from.path).await?;
        let ctx = self.inner.authorize(ctx, Action::PutObject, &to.path).await?;
        next.update_node(ctx, from, to).await
    }

    async fn delete_node(&self, ctx: RequestContext, node: Node, next: Next) -> Result<()> {
        let ctx = self.inner.authorize(ctx, Action::DeleteObject, &node.path).await?;
        next.delete_node(ctx, node).await
    }

    async fn get_object(
        &self,
        ctx: RequestContext,
        node: Node,
        req: GetRequest,
        next: Next,
    ) -> Result<ObjectReader> {
        let ctx = self.inner.authorize(ctx, Action::GetObject, &node.path).await?;
        next.get_object(ctx, node, req).await
    }

    async fn put_object(
        &self,
        ctx: RequestContext,
        node: Node,
        req: PutRequest,
        next: Next,
    ) -> Result<ObjectInfo> {
        let ctx = self.inner.authorize(ctx, Action::PutObject, &node.path).await?;
        next.put_object(ctx, node, req).await
    }

    async fn copy_object(
        &self,
        ctx: RequestContext,
        from: Node,
        to: Node,
        req: CopyRequest,
        next: Next,
    ) -> Result<ObjectInfo> {
        let ctx = self.inner.authorize(ctx, Action::GetObject, &from.path).await?;
        let ctx = self.inner.authorize(ctx, Action::PutObject, &to.path).await?;
        next.copy_object(ctx, from, to, req).await
    }

    async fn multipart_create(
        &self,
        ctx: RequestContext,
        node: Node,
        req: MultipartCreateRequest,
        next: Next,
    ) -> Result<String> {
        let ctx = self.inner.authorize(ctx, Action::PutObject, &node.path).await?;
        next.multipart_create(ctx, node, req).await
    }

    async fn multipart_list(
        &self,
        ctx: RequestContext,
        node: Node,
        next: Next,
    ) -> Result<Vec<MultipartUploadInfo>> {
        let ctx = self
            .inner
            .authorize(ctx, Action::ListBucketMultipartUploads, &node.path)
            .await?;
        next.multipart_list(ctx, node).await
    }

    async fn multipart_abort(
        &self,
        ctx: RequestContext,
        node: Node,
        upload_id: String,
        next: Next,
    ) -> Result<()> {
        let ctx = self
            .inner
            .authorize(ctx, Action::AbortMultipartUpload, &node.path)
            .await?;
        next.multipart_abort(ctx, node, upload_id).await
    }

    async fn multipart_complete(
        &self,
        ctx: RequestContext,
        node: Node,
        upload_id: String,
        parts: Vec<CompletePart>,
        next: Next,
    ) -> Result<ObjectInfo> {
        let ctx = self.inner.authorize(ctx, Action::PutObject, &node.path).await?;
        next.multipart_complete(ctx, node, upload_id, parts).await
    }

    async fn multipart_list_parts(
        &self,
        ctx: RequestContext,
        node: Node,
        upload_id: String,
        next: Next,
    ) -> Result<Vec<PartInfo>> {
        let ctx = self
            .inner
            .authorize(ctx, Action::ListMultipartUploadParts, &node.path)
            .await?;
        next.multipart_list_parts(ctx, node, upload_id).await
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
        let ctx = self.inner.authorize(ctx, Action::PutObject, &node.path).await?;
        next.multipart_put_part(ctx, node, upload_id, part_number, req)
            .await
    }
}
