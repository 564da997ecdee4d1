//! Fixtures shared by the unit tests

use federa_core::{
    BranchKey, ClientsPool, DataSourceSpec, MemoryConnector, MemoryRegistry, MemoryTree,
    MemoryVersions, Node, NodeAttr, PoolConfig, Principal, RequestContext, Workspace,
};
use federa_objects::MemoryObjectStore;
use std::sync::Arc;

pub(crate) struct Env {
    pub tree: Arc<MemoryTree>,
    pub versions: Arc<MemoryVersions>,
    pub connector: MemoryConnector,
    pub pool: Arc<ClientsPool>,
}

fn endpoint(ds: &str) -> String {
    format!("mem://{}", ds)
}

/// Pool over in-memory sources `(name, encrypted)`, bucket named after the source
pub(crate) async fn env(sources: &[(&str, bool)]) -> Env {
    let connector = MemoryConnector::new();
    let config = PoolConfig {
        sources: sources
            .iter()
            .map(|(name, encrypted)| DataSourceSpec::new(*name, endpoint(name), *name).encrypted(*encrypted))
            .collect(),
        ..Default::default()
    };
    let pool = ClientsPool::new(Arc::new(MemoryRegistry::new()), Arc::new(connector.clone()), config)
        .await
        .unwrap();
    Env {
        tree: Arc::new(MemoryTree::new()),
        versions: Arc::new(MemoryVersions::new()),
        connector,
        pool,
    }
}

impl Env {
    pub fn store(&self, ds: &str) -> MemoryObjectStore {
        self.connector.store(&endpoint(ds))
    }

    pub fn ctx(&self, principal: Principal, workspaces: Vec<Workspace>) -> RequestContext {
        let mut ctx = RequestContext::new().with_principal(principal);
        ctx.set_workspaces(workspaces);
        ctx.set_clients(self.tree.clone(), self.versions.clone());
        ctx
    }

    /// Context whose `In` branch is already bound to `ds`
    pub fn bound_ctx(&self, ds: &str) -> RequestContext {
        let mut ctx = self.ctx(Principal::user("u1", "alice"), Vec::new());
        ctx.branch_mut(BranchKey::In).ds = Some(self.pool.get_data_source_info(ds).unwrap());
        ctx
    }

    /// Index a collection and return it with its derived attributes
    pub fn root(&self, path: &str, uuid: &str) -> Node {
        self.tree.ensure_collection(path, Some(uuid))
    }
}

/// Node addressing `ds_path` inside data source `ds`
pub(crate) fn ds_node(ds: &str, ds_path: &str) -> Node {
    Node::leaf(format!("{}/{}", ds, ds_path))
        .with_attr(NodeAttr::DataSourceName, ds)
        .with_attr(NodeAttr::DataSourcePath, ds_path)
}
