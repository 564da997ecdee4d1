//! Router: the assembled filter chain behind a single handler surface

use crate::executor::Executor;
use crate::filter::{BranchFilter, Chain, Filter};
use crate::filters::{
    ArchiveFilter, AuthFilter, BinaryStoreConfig, BinaryStoreFilter, EncryptionFilter, MultiRootResolver,
    PathDataSourceResolver, PutFilter, RootCache, UuidDataSourceResolver, UuidWorkspaceResolver,
    VersionFilter, WorkspaceResolver, DEFAULT_POLICY_BUCKET,
};
use crate::handler::{CopyRequest, GetRequest, Handler, MultipartCreateRequest, PutRequest};
use async_trait::async_trait;
use federa_core::{
    BranchKey, ClientsPool, KeyService, ListNodesRequest, Node, NodeStream, PolicyChecker, RequestContext,
    Result, TreeClient, VersionClient, WorkspaceProvider,
};
use federa_objects::{CompletePart, MultipartUploadInfo, ObjectInfo, ObjectReader, PartInfo};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Node rewrite applied around a wrapped execution
pub type NodeRewrite = Arc<dyn Fn(&RequestContext, Node) -> Result<Node> + Send + Sync>;

/// Collaborators the router is built over
#[derive(Clone)]
pub struct RouterServices {
    pub pool: Arc<ClientsPool>,
    pub tree: Arc<dyn TreeClient>,
    pub versions: Arc<dyn VersionClient>,
    pub keys: Arc<dyn KeyService>,
    pub policy: Arc<dyn PolicyChecker>,
    pub workspaces: Arc<dyn WorkspaceProvider>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterOptions {
    /// Binary namespaces, stacked in this order after authorization
    pub binary_stores: Vec<BinaryStoreConfig>,
    /// Bucket presented to the policy service
    pub policy_bucket: String,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            binary_stores: vec![BinaryStoreConfig::thumbs(), BinaryStoreConfig::docstore()],
            policy_bucket: DEFAULT_POLICY_BUCKET.to_string(),
        }
    }
}

/// Entry point for every request. Each call is given the tree clients, then
/// enters the chain at its first filter.
#[derive(Clone)]
pub struct Router {
    chain: Arc<Chain>,
    tree: Arc<dyn TreeClient>,
    versions: Arc<dyn VersionClient>,
    roots: Arc<RootCache>,
}

impl Router {
    /// Path-addressed chain: auth, binary stores, workspace, multi-root,
    /// data source, archive, encryption, put, version, executor
    pub fn standard(services: RouterServices, options: RouterOptions) -> Self {
        let roots = Arc::new(RootCache::new());
        let mut filters = Self::front(&services, &options);
        filters.push(Arc::new(BranchFilter::new("workspace", WorkspaceResolver::new())));
        filters.push(Arc::new(BranchFilter::new("multi-root", MultiRootResolver::new(roots.clone()))));
        filters.push(Arc::new(BranchFilter::new(
            "datasource",
            PathDataSourceResolver::new(services.pool.clone()),
        )));
        filters.push(Arc::new(ArchiveFilter::new()));
        filters.extend(Self::back(&services));
        Self::assemble(services, filters, roots)
    }

    /// Identifier-addressed chain: `<slug>:<uuid>` nodes resolved through
    /// the index instead of by path
    pub fn by_uuid(services: RouterServices, options: RouterOptions) -> Self {
        let roots = Arc::new(RootCache::new());
        let mut filters = Self::front(&services, &options);
        filters.push(Arc::new(BranchFilter::new(
            "uuid-workspace",
            UuidWorkspaceResolver::new(roots.clone()),
        )));
        filters.push(Arc::new(BranchFilter::new(
            "uuid-datasource",
            UuidDataSourceResolver::new(services.pool.clone()),
        )));
        filters.extend(Self::back(&services));
        Self::assemble(services, filters, roots)
    }

    fn front(services: &RouterServices, options: &RouterOptions) -> Vec<Arc<dyn Filter>> {
        let mut filters: Vec<Arc<dyn Filter>> = Vec::with_capacity(options.binary_stores.len() + 1);
        filters.push(Arc::new(AuthFilter::new(
            services.policy.clone(),
            services.workspaces.clone(),
            options.policy_bucket.clone(),
        )));
        for store in &options.binary_stores {
            filters.push(Arc::new(BinaryStoreFilter::new(store.clone(), services.pool.clone())));
        }
        filters
    }

    fn back(services: &RouterServices) -> Vec<Arc<dyn Filter>> {
        vec![
            Arc::new(EncryptionFilter::new(services.keys.clone())) as Arc<dyn Filter>,
            Arc::new(PutFilter::new()),
            Arc::new(VersionFilter::new(services.pool.clone())),
        ]
    }

    fn assemble(services: RouterServices, filters: Vec<Arc<dyn Filter>>, roots: Arc<RootCache>) -> Self {
        let chain = Chain::new(filters, Arc::new(Executor::new()));
        debug!(filters = ?chain.filter_names(), "Router assembled");
        Self {
            chain,
            tree: services.tree,
            versions: services.versions,
            roots,
        }
    }

    pub fn filter_names(&self) -> Vec<&'static str> {
        self.chain.filter_names()
    }

    /// Drop cached workspace roots, e.g. after a root was moved
    pub fn invalidate_roots(&self) {
        self.roots.invalidate_all();
    }

    fn enrich(&self, mut ctx: RequestContext) -> RequestContext {
        ctx.set_clients(self.tree.clone(), self.versions.clone());
        ctx
    }

    /// Resolve `node` on branch `key` through every filter's input hook
    /// (after `pre`), hand the result to `callback` together with the
    /// matching output rewrite: output hooks in reverse order, then `post`.
    #[instrument(skip_all, fields(path = %node.path, branch = ?key))]
    pub async fn execute_wrapped<T, F, Fut>(
        &self,
        ctx: RequestContext,
        key: BranchKey,
        node: Node,
        pre: Option<NodeRewrite>,
        post: Option<NodeRewrite>,
        callback: F,
    ) -> Result<T>
    where
        F: FnOnce(RequestContext, Node, NodeRewrite) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut ctx = self.enrich(ctx);
        let mut node = match &pre {
            Some(pre) => pre(&ctx, node)?,
            None => node,
        };
        let resolvers = self.chain.resolvers();
        for resolver in &resolvers {
            if ctx.branch(key).is_some_and(|b| b.is_resolved()) {
                break;
            }
            (ctx, node) = resolver.update_input(ctx, key, node).await?;
        }

        let output: NodeRewrite = Arc::new(move |ctx: &RequestContext, node: Node| {
            let mut node = node;
            for resolver in resolvers.iter().rev() {
                node = resolver.update_output(ctx, key, node)?;
            }
            match &post {
                Some(post) => post(ctx, node),
                None => Ok(node),
            }
        });
        callback(ctx, node, output).await
    }
}

#[async_trait]
impl Handler for Router {
    async fn read_node(&self, ctx: RequestContext, node: Node) -> Result<Node> {
        self.chain.head().read_node(self.enrich(ctx), node).await
    }

    async fn list_nodes(&self, ctx: RequestContext, req: ListNodesRequest) -> Result<NodeStream> {
        self.chain.head().list_nodes(self.enrich(ctx), req).await
    }

    async fn create_node(&self, ctx: RequestContext, node: Node) -> Result<Node> {
        self.chain.head().create_node(self.enrich(ctx), node).await
    }

    async fn update_node(&self, ctx: RequestContext, from: Node, to: Node) -> Result<Node> {
        self.chain.head().update_node(self.enrich(ctx), from, to).await
    }

    async fn delete_node(&self, ctx: RequestContext, node: Node) -> Result<()> {
        self.chain.head().delete_node(self.enrich(ctx), node).await
    }

    async fn get_object(&self, ctx: RequestContext, node: Node, req: GetRequest) -> Result<ObjectReader> {
        self.chain.head().get_object(self.enrich(ctx), node, req).await
    }

    async fn put_object(&self, ctx: RequestContext, node: Node, req: PutRequest) -> Result<ObjectInfo> {
        self.chain.head().put_object(self.enrich(ctx), node, req).await
    }

    async fn copy_object(&self, ctx: RequestContext, from: Node, to: Node, req: CopyRequest) -> Result<ObjectInfo> {
        self.chain.head().copy_object(self.enrich(ctx), from, to, req).await
    }

    async fn multipart_create(
        &self,
        ctx: RequestContext,
        node: Node,
        req: MultipartCreateRequest,
    ) -> Result<String> {
        self.chain.head().multipart_create(self.enrich(ctx), node, req).await
    }

    async fn multipart_list(&self, ctx: RequestContext, node: Node) -> Result<Vec<MultipartUploadInfo>> {
        self.chain.head().multipart_list(self.enrich(ctx), node).await
    }

    async fn multipart_abort(&self, ctx: RequestContext, node: Node, upload_id: String) -> Result<()> {
        self.chain.head().multipart_abort(self.enrich(ctx), node, upload_id).await
    }

    async fn multipart_complete(
        &self,
        ctx: RequestContext,
        node: Node,
        upload_id: String,
        parts: Vec<CompletePart>,
    ) -> Result<ObjectInfo> {
        self.chain
            .head()
            .multipart_complete(self.enrich(ctx), node, upload_id, parts)
            .await
    }

    async fn multipart_list_parts(
        &self,
        ctx: RequestContext,
        node: Node,
        upload_id: String,
    ) -> Result<Vec<PartInfo>> {
        self.chain
            .head()
            .multipart_list_parts(self.enrich(ctx), node, upload_id)
            .await
    }

    async fn multipart_put_part(
        &self,
        ctx: RequestContext,
        node: Node,
        upload_id: String,
        part_number: u32,
        req: PutRequest,
    ) -> Result<PartInfo> {
        self.chain
            .head()
            .multipart_put_part(self.enrich(ctx), node, upload_id, part_number, req)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{env, Env};
    use federa_core::{
        MemoryKeyService, MemoryRoleDao, NodeAttr, Principal, RoleWorkspaces, StaticPolicy, Workspace,
    };

    fn services(env: &Env) -> RouterServices {
        RouterServices {
            pool: env.pool.clone(),
            tree: env.tree.clone(),
            versions: env.versions.clone(),
            keys: Arc::new(MemoryKeyService::new()),
            policy: Arc::new(StaticPolicy::allow_all()),
            workspaces: Arc::new(RoleWorkspaces::new(Arc::new(MemoryRoleDao::new()))),
        }
    }

    #[tokio::test]
    async fn test_chain_order() {
        let env = env(&[("ds1", false)]).await;
        let router = Router::standard(services(&env), RouterOptions::default());
        assert_eq!(
            router.filter_names(),
            vec![
                "auth",
                "binary-store",
                "binary-store",
                "workspace",
                "multi-root",
                "datasource",
                "archive",
                "encryption",
                "put",
                "version"
            ]
        );

        let by_uuid = Router::by_uuid(services(&env), RouterOptions::default());
        assert_eq!(by_uuid.filter_names()[3..5], ["uuid-workspace", "uuid-datasource"]);
    }

    #[tokio::test]
    async fn test_invalidate_roots_clears_cache() {
        let env = env(&[("ds1", false)]).await;
        let root = env.root("ds1/home/alice", "root-alice");
        let router = Router::standard(services(&env), RouterOptions::default());
        let ws = Workspace::new("ws-alice", "alice").with_roots([root.uuid.clone()]);
        let ctx = env.ctx(Principal::user("u1", "alice"), vec![ws.clone()]);

        router.roots.load_all(&ctx, &ws).await.unwrap();
        assert_eq!(router.roots.len(), 1);
        router.invalidate_roots();
        assert!(router.roots.is_empty());
    }

    #[tokio::test]
    async fn test_execute_wrapped_resolves_and_restores() {
        let env = env(&[("ds1", false)]).await;
        let root = env.root("ds1/home/alice", "root-alice");
        let router = Router::standard(services(&env), RouterOptions::default());
        let ws = Workspace::new("ws-alice", "alice").with_roots([root.uuid.clone()]);
        let ctx = env.ctx(Principal::user("u1", "alice"), vec![ws]);

        let pre: NodeRewrite = Arc::new(|_ctx: &RequestContext, mut node: Node| {
            node.path = format!("alice/{}", node.path);
            Ok(node)
        });
        let post: NodeRewrite = Arc::new(|_ctx: &RequestContext, mut node: Node| {
            node.path = node.path.trim_start_matches("alice/").to_string();
            Ok(node)
        });

        let (node, ds, restored) = router
            .execute_wrapped(
                ctx,
                BranchKey::In,
                Node::leaf("photos/p.jpg"),
                Some(pre),
                Some(post),
                |ctx, node, output| async move {
                    let ds = ctx.ds(BranchKey::In).map(|d| d.name.clone());
                    let restored = output(&ctx, node.clone())?;
                    Ok((node, ds, restored))
                },
            )
            .await
            .unwrap();

        assert_eq!(ds.as_deref(), Some("ds1"));
        assert_eq!(node.path, "ds1/home/alice/photos/p.jpg");
        assert_eq!(node.attr(NodeAttr::DataSourcePath), Some("home/alice/photos/p.jpg"));
        assert_eq!(restored.path, "photos/p.jpg");
    }
}
