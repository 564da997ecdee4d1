//! Binary stores: a fixed top-level namespace served straight from a
//! dedicated data source (thumbnails, document binaries).

use crate::filter::{Filter, Next};
use crate::handler::{CopyRequest, GetRequest, Handler, PutRequest};
use async_trait::async_trait;
use federa_core::node::{base_name, split_first};
use federa_core::{
    BranchKey, ClientsPool, CoreError, ListNodesRequest, Node, NodeAttr, NodeStream, Principal,
    RequestContext, Result, ALIAS_DOCSTORE_BINARIES, ALIAS_THUMBSTORE,
};
use federa_objects::{ObjectInfo, ObjectReader};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryStoreConfig {
    /// Leading path segment served by this store
    pub namespace: String,
    /// Data source (or alias) holding the binaries
    pub source: String,
    #[serde(default)]
    pub allow_anon_read: bool,
    #[serde(default)]
    pub allow_put: bool,
}

impl BinaryStoreConfig {
    pub fn new(namespace: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            source: source.into(),
            allow_anon_read: false,
            allow_put: false,
        }
    }

    /// Thumbnails: readable without authentication
    pub fn thumbs() -> Self {
        Self::new("thumbs", ALIAS_THUMBSTORE).anonymous_read(true)
    }

    pub fn docstore() -> Self {
        Self::new("binaries", ALIAS_DOCSTORE_BINARIES)
    }

    pub fn anonymous_read(mut self, allow: bool) -> Self {
        self.allow_anon_read = allow;
        self
    }

    pub fn writable(mut self, allow: bool) -> Self {
        self.allow_put = allow;
        self
    }
}

pub struct BinaryStoreFilter {
    config: BinaryStoreConfig,
    pool: Arc<ClientsPool>,
}

impl BinaryStoreFilter {
    pub fn new(config: BinaryStoreConfig, pool: Arc<ClientsPool>) -> Self {
        Self { config, pool }
    }

    fn owns(&self, node: &Node) -> bool {
        let (first, _) = split_first(&node.path);
        first == self.config.namespace
    }

    fn forbidden(&self, what: &str) -> CoreError {
        CoreError::Forbidden(format!("{} is not allowed in {}", what, self.config.namespace))
    }

    /// Bind the branch to the store; the object key is the node's base name
    fn bind(&self, mut ctx: RequestContext, key: BranchKey, mut node: Node) -> Result<(RequestContext, Node)> {
        let ds = self.pool.get_data_source_info(&self.config.source)?;
        let object = base_name(&node.path).to_string();
        node.set_attr(NodeAttr::DataSourceName, ds.name.clone());
        node.set_attr(NodeAttr::DataSourcePath, object);
        let branch = ctx.branch_mut(key);
        branch.ds = Some(ds);
        branch.binary = true;
        Ok((ctx, node))
    }

    fn reader_context(&self, mut ctx: RequestContext) -> Result<RequestContext> {
        if ctx.principal().is_none() {
            if !self.config.allow_anon_read {
                return Err(CoreError::Forbidden("authentication required".into()));
            }
            ctx.set_principal(Principal::anonymous());
        }
        Ok(ctx)
    }
}

#[async_trait]
impl Filter for BinaryStoreFilter {
    fn name(&self) -> &'static str {
        "binary-store"
    }

    #[instrument(skip_all, fields(namespace = %self.config.namespace, path = %node.path))]
    async fn read_node(&self, ctx: RequestContext, node: Node, next: Next) -> Result<Node> {
        if !self.owns(&node) {
            return next.read_node(ctx, node).await;
        }
        let ctx = self.reader_context(ctx)?;
        let key = base_name(&node.path).to_string();
        let ds = self.pool.get_data_source_info(&self.config.source)?;
        let info = ds
            .client
            .stat_object(&ds.bucket, &key)
            .await
            .map_err(|e| CoreError::backend(&ds.bucket, &key, e))?;
        debug!(request = %ctx.request_id(), size = info.size, "Binary stat");

        let mut stat = Node::leaf(format!("{}/{}", self.config.namespace, key))
            .uuid(key)
            .size(info.size as i64)
            .mtime(info.last_modified.timestamp())
            .etag(info.etag);
        if let Some(content_type) = info.content_type {
            stat.set_attr(NodeAttr::ContentType, content_type);
        }
        Ok(stat)
    }

    async fn list_nodes(&self, ctx: RequestContext, req: ListNodesRequest, next: Next) -> Result<NodeStream> {
        if self.owns(&req.node) {
            return Ok(NodeStream::empty());
        }
        next.list_nodes(ctx, req).await
    }

    async fn create_node(&self, ctx: RequestContext, node: Node, next: Next) -> Result<Node> {
        if self.owns(&node) {
            return Err(self.forbidden("creating nodes"));
        }
        next.create_node(ctx, node).await
    }

    async fn update_node(&self, ctx: RequestContext, from: Node, to: Node, next: Next) -> Result<Node> {
        if self.owns(&from) || self.owns(&to) {
            return Err(self.forbidden("moving nodes"));
        }
        next.update_node(ctx, from, to).await
    }

    async fn delete_node(&self, ctx: RequestContext, node: Node, next: Next) -> Result<()> {
        if !self.owns(&node) {
            return next.delete_node(ctx, node).await;
        }
        if !self.config.allow_put {
            return Err(self.forbidden("deleting"));
        }
        let (ctx, node) = self.bind(ctx, BranchKey::In, node)?;
        next.delete_node(ctx, node).await
    }

    async fn get_object(
        &self,
        ctx: RequestContext,
        node: Node,
        req: GetRequest,
        next: Next,
    ) -> Result<ObjectReader> {
        if !self.owns(&node) {
            return next.get_object(ctx, node, req).await;
        }
        let ctx = self.reader_context(ctx)?;
        let (ctx, node) = self.bind(ctx, BranchKey::In, node)?;
        next.get_object(ctx, node, req).await
    }

    async fn put_object(
        &self,
        ctx: RequestContext,
        node: Node,
        req: PutRequest,
        next: Next,
    ) -> Result<ObjectInfo> {
        if !self.owns(&node) {
            return next.put_object(ctx, node, req).await;
        }
        if !self.config.allow_put || ctx.principal().is_none() {
            return Err(self.forbidden("writing"));
        }
        let (ctx, node) = self.bind(ctx, BranchKey::In, node)?;
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
        let (ctx, from) = if self.owns(&from) {
            self.bind(ctx, BranchKey::From, from)?
        } else {
            (ctx, from)
        };
        let (ctx, to) = if self.owns(&to) {
            if !self.config.allow_put {
                return Err(self.forbidden("writing"));
            }
            self.bind(ctx, BranchKey::To, to)?
        } else {
            (ctx, to)
        };
        next.copy_object(ctx, from, to, req).await
    }
}
