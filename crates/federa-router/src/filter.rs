//! Filter chain
//!
//! Filters hold no reference to their successor. The chain is an immutable
//! list driven through [`Next`], which either calls the following filter or,
//! past the end, the terminal handler. A filter overrides only the operations
//! it cares about; every other method passes straight through.

use crate::handler::{CopyRequest, GetRequest, Handler, MultipartCreateRequest, PutRequest};
use async_trait::async_trait;
use federa_core::{BranchKey, ListNodesRequest, Node, NodeStream, RequestContext, Result};
use federa_objects::{CompletePart, MultipartUploadInfo, ObjectInfo, ObjectReader, PartInfo};
use std::sync::Arc;

/// Input and output rewrites of a resolution filter
#[async_trait]
pub trait BranchResolver: Send + Sync {
    /// Rewrite a node on its way down, recording resolution state on the
    /// context branch `key`
    async fn update_input(
        &self,
        ctx: RequestContext,
        key: BranchKey,
        node: Node,
    ) -> Result<(RequestContext, Node)>;

    /// Rewrite a node on its way back up
    fn update_output(&self, ctx: &RequestContext, key: BranchKey, node: Node) -> Result<Node>;

    /// Answer a listing without descending (virtual roots)
    async fn list_virtual(&self, _ctx: &RequestContext, _node: &Node) -> Result<Option<Vec<Node>>> {
        Ok(None)
    }

    /// Answer a read without descending
    async fn read_virtual(&self, _ctx: &RequestContext, _node: &Node) -> Result<Option<Node>> {
        Ok(None)
    }
}

/// A stage of the pipeline
#[async_trait]
pub trait Filter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Resolution hooks exposed to `Router::execute_wrapped`
    fn resolver(&self) -> Option<Arc<dyn BranchResolver>> {
        None
    }

    async fn read_node(&self, ctx: RequestContext, node: Node, next: Next) -> Result<Node> {
        next.read_node(ctx, node).await
    }

    async fn list_nodes(&self, ctx: RequestContext, req: ListNodesRequest, next: Next) -> Result<NodeStream> {
        next.list_nodes(ctx, req).await
    }

    async fn create_node(&self, ctx: RequestContext, node: Node, next: Next) -> Result<Node> {
        next.create_node(ctx, node).await
    }

    async fn update_node(&self, ctx: RequestContext, from: Node, to: Node, next: Next) -> Result<Node> {
        next.update_node(ctx, from, to).await
    }

    async fn delete_node(&self, ctx: RequestContext, node: Node, next: Next) -> Result<()> {
        next.delete_node(ctx, node).await
    }

    async fn get_object(
        &self,
        ctx: RequestContext,
        node: Node,
        req: GetRequest,
        next: Next,
    ) -> Result<ObjectReader> {
        next.get_object(ctx, node, req).await
    }

    async fn put_object(
        &self,
        ctx: RequestContext,
        node: Node,
        req: PutRequest,
        next: Next,
    ) -> Result<ObjectInfo> {
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
        next.copy_object(ctx, from, to, req).await
    }

    async fn multipart_create(
        &self,
        ctx: RequestContext,
        node: Node,
        req: MultipartCreateRequest,
        next: Next,
    ) -> Result<String> {
        next.multipart_create(ctx, node, req).await
    }

    async fn multipart_list(
        &self,
        ctx: RequestContext,
        node: Node,
        next: Next,
    ) -> Result<Vec<MultipartUploadInfo>> {
        next.multipart_list(ctx, node).await
    }

    async fn multipart_abort(
        &self,
        ctx: RequestContext,
        node: Node,
        upload_id: String,
        next: Next,
    ) -> Result<()> {
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
        next.multipart_complete(ctx, node, upload_id, parts).await
    }

    async fn multipart_list_parts(
        &self,
        ctx: RequestContext,
        node: Node,
        upload_id: String,
        next: Next,
    ) -> Result<Vec<PartInfo>> {
        next.multipart_list_parts(ctx, node, upload_id).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn multipart_put_part(
        &self,
        ctx: RequestContext,
        node: Node,
        upload_id: String,
        part_number: u32,
        req: PutRequest,
        next: Next,
    ) -> Result<PartInfo> {
        next.multipart_put_part(ctx, node, upload_id, part_number, req)
            .await
    }
}

/// Ordered filters in front of a terminal handler
pub struct Chain {
    filters: Vec<Arc<dyn Filter>>,
    terminal: Arc<dyn Handler>,
}

impl Chain {
    pub fn new(filters: Vec<Arc<dyn Filter>>, terminal: Arc<dyn Handler>) -> Arc<Self> {
        Arc::new(Self { filters, terminal })
    }

    /// Entry point of the chain
    pub fn head(self: &Arc<Self>) -> Next {
        Next {
            chain: self.clone(),
            pos: 0,
        }
    }

    pub fn filter_names(&self) -> Vec<&'static str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    /// Resolution hooks in declared order
    pub fn resolvers(&self) -> Vec<Arc<dyn BranchResolver>> {
        self.filters.iter().filter_map(|f| f.resolver()).collect()
    }
}

/// Remainder of the chain after the current filter
#[derive(Clone)]
pub struct Next {
    chain: Arc<Chain>,
    pos: usize,
}

impl Next {
    fn step(&self) -> Option<(&Arc<dyn Filter>, Next)> {
        self.chain.filters.get(self.pos).map(|filter| {
            (
                filter,
                Next {
                    chain: self.chain.clone(),
                    pos: self.pos + 1,
                },
            )
        })
    }

    /// The remainder as a shareable handler, for tasks that outlive the call
    pub fn into_handler(self) -> Arc<dyn Handler> {
        Arc::new(self)
    }
}

#[async_trait]
impl Handler for Next {
    async fn read_node(&self, ctx: RequestContext, node: Node) -> Result<Node> {
        match self.step() {
            Some((filter, next)) => filter.read_node(ctx, node, next).await,
            None => self.chain.terminal.read_node(ctx, node).await,
        }
    }

    async fn list_nodes(&self, ctx: RequestContext, req: ListNodesRequest) -> Result<NodeStream> {
        match self.step() {
            Some((filter, next)) => filter.list_nodes(ctx, req, next).await,
            None => self.chain.terminal.list_nodes(ctx, req).await,
        }
    }

    async fn create_node(&self, ctx: RequestContext, node: Node) -> Result<Node> {
        match self.step() {
            Some((filter, next)) => filter.create_node(ctx, node, next).await,
            None => self.chain.terminal.create_node(ctx, node).await,
        }
    }

    async fn update_node(&self, ctx: RequestContext, from: Node, to: Node) -> Result<Node> {
        match self.step() {
            Some((filter, next)) => filter.update_node(ctx, from, to, next).await,
            None => self.chain.terminal.update_node(ctx, from, to).await,
        }
    }

    async fn delete_node(&self, ctx: RequestContext, node: Node) -> Result<()> {
        match self.step() {
            Some((filter, next)) => filter.delete_node(ctx, node, next).await,
            None => self.chain.terminal.delete_node(ctx, node).await,
        }
    }

    async fn get_object(&self, ctx: RequestContext, node: Node, req: GetRequest) -> Result<ObjectReader> {
        match self.step() {
            Some((filter, next)) => filter.get_object(ctx, node, req, next).await,
            None => self.chain.terminal.get_object(ctx, node, req).await,
        }
    }

    async fn put_object(&self, ctx: RequestContext, node: Node, req: PutRequest) -> Result<ObjectInfo> {
        match self.step() {
            Some((filter, next)) => filter.put_object(ctx, node, req, next).await,
            None => self.chain.terminal.put_object(ctx, node, req).await,
        }
    }

    async fn copy_object(
        &self,
        ctx: RequestContext,
        from: Node,
        to: Node,
        req: CopyRequest,
    ) -> Result<ObjectInfo> {
        match self.step() {
            Some((filter, next)) => filter.copy_object(ctx, from, to, req, next).await,
            None => self.chain.terminal.copy_object(ctx, from, to, req).await,
        }
    }

    async fn multipart_create(
        &self,
        ctx: RequestContext,
        node: Node,
        req: MultipartCreateRequest,
    ) -> Result<String> {
        match self.step() {
            Some((filter, next)) => filter.multipart_create(ctx, node, req, next).await,
            None => self.chain.terminal.multipart_create(ctx, node, req).await,
        }
    }

    async fn multipart_list(&self, ctx: RequestContext, node: Node) -> Result<Vec<MultipartUploadInfo>> {
        match self.step() {
            Some((filter, next)) => filter.multipart_list(ctx, node, next).await,
            None => self.chain.terminal.multipart_list(ctx, node).await,
        }
    }

    async fn multipart_abort(&self, ctx: RequestContext, node: Node, upload_id: String) -> Result<()> {
        match self.step() {
            Some((filter, next)) => filter.multipart_abort(ctx, node, upload_id, next).await,
            None => self.chain.terminal.multipart_abort(ctx, node, upload_id).await,
        }
    }

    async fn multipart_complete(
        &self,
        ctx: RequestContext,
        node: Node,
        upload_id: String,
        parts: Vec<CompletePart>,
    ) -> Result<ObjectInfo> {
        match self.step() {
            Some((filter, next)) => {
                filter
                    .multipart_complete(ctx, node, upload_id, parts, next)
                    .await
            }
            None => {
                self.chain
                    .terminal
                    .multipart_complete(ctx, node, upload_id, parts)
                    .await
            }
        }
    }

    async fn multipart_list_parts(
        &self,
        ctx: RequestContext,
        node: Node,
        upload_id: String,
    ) -> Result<Vec<PartInfo>> {
        match self.step() {
            Some((filter, next)) => filter.multipart_list_parts(ctx, node, upload_id, next).await,
            None => {
                self.chain
                    .terminal
                    .multipart_list_parts(ctx, node, upload_id)
                    .await
            }
        }
    }

    async fn multipart_put_part(
        &self,
        ctx: RequestContext,
        node: Node,
        upload_id: String,
        part_number: u32,
        req: PutRequest,
    ) -> Result<PartInfo> {
        match self.step() {
            Some((filter, next)) => {
                filter
                    .multipart_put_part(ctx, node, upload_id, part_number, req, next)
                    .await
            }
            None => {
                self.chain
                    .terminal
                    .multipart_put_part(ctx, node, upload_id, part_number, req)
                    .await
            }
        }
    }
}

/// Adapts a [`BranchResolver`] into a filter: inputs are rewritten before
/// calling down, outputs after the call returns. A branch that already has a
/// data source is left untouched.
pub struct BranchFilter<R> {
    name: &'static str,
    resolver: Arc<R>,
}

impl<R: BranchResolver + 'static> BranchFilter<R> {
    pub fn new(name: &'static str, resolver: R) -> Self {
        Self {
            name,
            resolver: Arc::new(resolver),
        }
    }

    async fn input(&self, ctx: RequestContext, key: BranchKey, node: Node) -> Result<(RequestContext, Node)> {
        if ctx.branch(key).is_some_and(|b| b.is_resolved()) {
            return Ok((ctx, node));
        }
        self.resolver.update_input(ctx, key, node).await
    }
}

#[async_trait]
impl<R: BranchResolver + 'static> Filter for BranchFilter<R> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn resolver(&self) -> Option<Arc<dyn BranchResolver>> {
        Some(self.resolver.clone() as Arc<dyn BranchResolver>)
    }

    async fn read_node(&self, ctx: RequestContext, node: Node, next: Next) -> Result<Node> {
        if let Some(node) = self.resolver.read_virtual(&ctx, &node).await? {
            return Ok(node);
        }
        let (ctx, node) = self.input(ctx, BranchKey::In, node).await?;
        let out = next.read_node(ctx.clone(), node).await?;
        self.resolver.update_output(&ctx, BranchKey::In, out)
    }

    async fn list_nodes(&self, ctx: RequestContext, mut req: ListNodesRequest, next: Next) -> Result<NodeStream> {
        if !req.versions {
            if let Some(nodes) = self.resolver.list_virtual(&ctx, &req.node).await? {
                return Ok(NodeStream::from_nodes(nodes));
            }
        }
        let (ctx, node) = self.input(ctx, BranchKey::In, req.node).await?;
        req.node = node;
        let stream = next.list_nodes(ctx.clone(), req).await?;
        let resolver = self.resolver.clone();
        // nodes falling outside the resolved scope are dropped
        Ok(stream.map_nodes(move |node| resolver.update_output(&ctx, BranchKey::In, node).ok()))
    }

    async fn create_node(&self, ctx: RequestContext, node: Node, next: Next) -> Result<Node> {
        let (ctx, node) = self.input(ctx, BranchKey::In, node).await?;
        let out = next.create_node(ctx.clone(), node).await?;
        self.resolver.update_output(&ctx, BranchKey::In, out)
    }

    async fn update_node(&self, ctx: RequestContext, from: Node, to: Node, next: Next) -> Result<Node> {
        let (ctx, from) = self.input(ctx, BranchKey::From, from).await?;
        let (ctx, to) = self.input(ctx, BranchKey::To, to).await?;
        let out = next.update_node(ctx.clone(), from, to).await?;
        self.resolver.update_output(&ctx, BranchKey::To, out)
    }

    async fn delete_node(&self, ctx: RequestContext, node: Node, next: Next) -> Result<()> {
        let (ctx, node) = self.input(ctx, BranchKey::In, node).await?;
        next.delete_node(ctx, node).await
    }

    async fn get_object(
        &self,
        ctx: RequestContext,
        node: Node,
        req: GetRequest,
        next: Next,
    ) -> Result<ObjectReader> {
        let (ctx, node) = self.input(ctx, BranchKey::In, node).await?;
        next.get_object(ctx, node, req).await
    }

    async fn put_object(
        &self,
        ctx: RequestContext,
        node: Node,
        req: PutRequest,
        next: Next,
    ) -> Result<ObjectInfo> {
        let (ctx, node) = self.input(ctx, BranchKey::In, node).await?;
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
        let (ctx, from) = self.input(ctx, BranchKey::From, from).await?;
        let (ctx, to) = self.input(ctx, BranchKey::To, to).await?;
        next.copy_object(ctx, from, to, req).await
    }

    async fn multipart_create(
        &self,
        ctx: RequestContext,
        node: Node,
        req: MultipartCreateRequest,
        next: Next,
    ) -> Result<String> {
        let (ctx, node) = self.input(ctx, BranchKey::In, node).await?;
        next.multipart_create(ctx, node, req).await
    }

    async fn multipart_list(
        &self,
        ctx: RequestContext,
        node: Node,
        next: Next,
    ) -> Result<Vec<MultipartUploadInfo>> {
        let (ctx, node) = self.input(ctx, BranchKey::In, node).await?;
        next.multipart_list(ctx, node).await
    }

    async fn multipart_abort(
        &self,
        ctx: RequestContext,
        node: Node,
        upload_id: String,
        next: Next,
    ) -> Result<()> {
        let (ctx, node) = self.input(ctx, BranchKey::In, node).await?;
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
        let (ctx, node) = self.input(ctx, BranchKey::In, node).await?;
        next.multipart_complete(ctx, node, upload_id, parts).await
    }

    async fn multipart_list_parts(
        &self,
        ctx: RequestContext,
        node: Node,
        upload_id: String,
        next: Next,
    ) -> Result<Vec<PartInfo>> {
        let (ctx, node) = self.input(ctx, BranchKey::In, node).await?;
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
        let (ctx, node) = self.input(ctx, BranchKey::In, node).await?;
        next.multipart_put_part(ctx, node, upload_id, part_number, req)
            .await
    }
}
