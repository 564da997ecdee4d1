//! Startup and shutdown of the gateway core

use crate::config::GatewayConfig;
use federa_core::{
    BackendConnector, ClientsPool, DataSourceIndexer, HttpConnector, MemoryConnector, MemoryKeyService,
    MemoryRegistry, MemoryRoleDao, MemoryTree, MemoryVersions, RoleWorkspaces, StaticPolicy,
};
use federa_router::{Router, RouterServices};
use std::sync::Arc;
use tracing::{info, warn};

/// Running gateway core: the pool and both routers over it
pub struct Gateway {
    pub pool: Arc<ClientsPool>,
    pub router: Router,
    pub uuid_router: Router,
    pub registry: Arc<MemoryRegistry>,
    pub roles: Arc<MemoryRoleDao>,
    pub workspaces: Arc<RoleWorkspaces>,
}

impl Gateway {
    pub async fn start(config: &GatewayConfig) -> anyhow::Result<Self> {
        let tree = Arc::new(MemoryTree::new());
        let registry = Arc::new(MemoryRegistry::new());

        let connector: Arc<dyn BackendConnector> = if config.use_memory_store {
            warn!("Serving every data source from memory, nothing is persisted");
            let memory = MemoryConnector::new();
            for source in &config.sources {
                memory.store(&source.endpoint).subscribe(Arc::new(DataSourceIndexer::new(
                    source.name.clone(),
                    source.bucket.clone(),
                    tree.clone(),
                )));
            }
            Arc::new(memory)
        } else {
            let mut http = HttpConnector::new().with_timeout(config.s3_timeout());
            if let Some(token) = &config.s3_token {
                http = http.with_token(token.clone());
            }
            Arc::new(http)
        };

        let pool = ClientsPool::new(registry.clone(), connector, config.pool_config()).await?;
        info!(sources = ?pool.list_data_sources(), "Data sources ready");

        let roles = Arc::new(MemoryRoleDao::new());
        let workspaces = Arc::new(RoleWorkspaces::new(roles.clone()));
        let services = RouterServices {
            pool: pool.clone(),
            tree,
            versions: Arc::new(MemoryVersions::new()),
            keys: Arc::new(MemoryKeyService::new()),
            policy: Arc::new(StaticPolicy::allow_all()),
            workspaces: workspaces.clone(),
        };
        let router = Router::standard(services.clone(), config.router_options());
        let uuid_router = Router::by_uuid(services, config.router_options());
        info!(filters = ?router.filter_names(), "Router ready");

        Ok(Self {
            pool,
            router,
            uuid_router,
            registry,
            roles,
            workspaces,
        })
    }

    /// Stop the registry watcher; outstanding clients stay usable
    pub async fn shutdown(&self) {
        self.pool.close().await;
        info!("Gateway core stopped");
    }
}
