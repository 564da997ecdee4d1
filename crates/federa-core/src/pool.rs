//! Clients pool
//!
//! Maps data-source names to backend clients, kept current from the service
//! registry. All mutations of the source and alias tables happen under one
//! write lock, so readers never observe a half-updated entry.

use crate::context::DsInfo;
use crate::registry::{RegistryEvent, RegistryEventKind, ServiceInfo, ServiceRegistry};
use crate::{CoreError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use federa_objects::{MemoryObjectStore, ObjectBackend, S3BackendConfig, S3HttpClient};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub const ALIAS_THUMBSTORE: &str = "thumbstore";
pub const ALIAS_DOCSTORE_BINARIES: &str = "docstore-binaries";
pub const ALIAS_VERSIONS: &str = "versions";

/// Namespaces every pool serves, with the bucket each uses on the default source
const WELL_KNOWN_ALIASES: [(&str, &str); 3] = [
    (ALIAS_THUMBSTORE, "thumbs"),
    (ALIAS_DOCSTORE_BINARIES, "binaries"),
    (ALIAS_VERSIONS, "versions"),
];

/// Connection parameters of one data source
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceSpec {
    pub name: String,
    pub endpoint: String,
    pub bucket: String,
    #[serde(default)]
    pub encrypted: bool,
}

impl DataSourceSpec {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            bucket: bucket.into(),
            encrypted: false,
        }
    }

    pub fn encrypted(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }

    /// Read a `sync-*` service advertisement
    pub fn from_service(service: &ServiceInfo) -> Result<Self> {
        let name = service.data_source_name().ok_or_else(|| {
            CoreError::InvalidArgument(format!("{} is not a data-source service", service.name))
        })?;
        let endpoint = service.http_url().filter(|e| !e.is_empty()).ok_or_else(|| {
            CoreError::Unavailable(format!("data source {} advertises no endpoint", name))
        })?;
        let bucket = service.bucket().unwrap_or(name);
        Ok(Self::new(name, endpoint, bucket).encrypted(service.encrypted()))
    }
}

/// Alias redirecting a name to another source, optionally with another bucket
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasConfig {
    pub alias: String,
    pub target: String,
    #[serde(default)]
    pub bucket: Option<String>,
}

/// Creates backend clients for data sources
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(&self, spec: &DataSourceSpec) -> Result<Arc<dyn ObjectBackend>>;
}

/// Connects to S3-compatible endpoints over HTTP
#[derive(Clone, Debug, Default)]
pub struct HttpConnector {
    token: Option<String>,
    timeout: Option<Duration>,
}

impl HttpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl BackendConnector for HttpConnector {
    async fn connect(&self, spec: &DataSourceSpec) -> Result<Arc<dyn ObjectBackend>> {
        let mut config = S3BackendConfig::new(spec.endpoint.clone());
        if let Some(token) = &self.token {
            config = config.with_token(token.clone());
        }
        if let Some(timeout) = self.timeout {
            config = config.with_timeout(timeout);
        }
        let client = S3HttpClient::new(spec.name.clone(), config)
            .map_err(|e| CoreError::Unavailable(format!("{}: {}", spec.name, e)))?;
        Ok(Arc::new(client))
    }
}

/// Serves every endpoint from an in-memory store, one store per endpoint
#[derive(Clone, Default)]
pub struct MemoryConnector {
    stores: Arc<DashMap<String, MemoryObjectStore>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store behind `endpoint`, created on first use
    pub fn store(&self, endpoint: &str) -> MemoryObjectStore {
        self.stores
            .entry(endpoint.to_string())
            .or_insert_with(|| MemoryObjectStore::new(endpoint))
            .clone()
    }
}

#[async_trait]
impl BackendConnector for MemoryConnector {
    async fn connect(&self, spec: &DataSourceSpec) -> Result<Arc<dyn ObjectBackend>> {
        Ok(Arc::new(self.store(&spec.endpoint)))
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Follow registry changes after the initial discovery
    #[serde(default)]
    pub watch: bool,
    /// Sources registered directly, without the registry
    #[serde(default)]
    pub sources: Vec<DataSourceSpec>,
    #[serde(default)]
    pub aliases: Vec<AliasConfig>,
    /// Source backing the well-known namespaces not covered by `aliases`.
    /// Defaults to the first configured source, else the first discovered one.
    #[serde(default)]
    pub default_source: Option<String>,
}

#[derive(Clone, Debug)]
struct AliasEntry {
    target: String,
    bucket: Option<String>,
}

#[derive(Default)]
struct PoolState {
    sources: HashMap<String, DsInfo>,
    aliases: HashMap<String, AliasEntry>,
}

/// Shared between the pool and its watcher task
#[derive(Clone)]
struct Discovery {
    state: Arc<RwLock<PoolState>>,
    connector: Arc<dyn BackendConnector>,
}

impl Discovery {
    /// Point the well-known namespaces without a configured alias at the
    /// default source, each in its own bucket
    fn register_well_known(&self, config: &PoolConfig) {
        let mut state = self.state.write();
        let default = config
            .default_source
            .clone()
            .or_else(|| config.sources.first().map(|s| s.name.clone()))
            .or_else(|| state.sources.keys().min().cloned());
        let Some(default) = default else {
            warn!("No data source to back the well-known namespaces");
            return;
        };
        for (alias, bucket) in WELL_KNOWN_ALIASES {
            if alias == default || state.aliases.contains_key(alias) {
                continue;
            }
            state.aliases.insert(
                alias.to_string(),
                AliasEntry {
                    target: default.clone(),
                    bucket: Some(bucket.to_string()),
                },
            );
            debug!(alias, source = %default, bucket, "Well-known namespace registered");
        }
    }

    async fn register(&self, spec: &DataSourceSpec) -> Result<()> {
        let client = self.connector.connect(spec).await?;
        let info = DsInfo {
            name: spec.name.clone(),
            client,
            bucket: spec.bucket.clone(),
            encrypted: spec.encrypted,
        };
        self.state.write().sources.insert(spec.name.clone(), info);
        info!(source = %spec.name, bucket = %spec.bucket, "Data source registered");
        Ok(())
    }

    async fn register_service(&self, service: &ServiceInfo) -> Result<()> {
        let spec = DataSourceSpec::from_service(service)?;
        self.register(&spec).await
    }

    fn remove(&self, name: &str) -> bool {
        let removed = self.state.write().sources.remove(name).is_some();
        if removed {
            info!(source = %name, "Data source removed");
        }
        removed
    }

    async fn apply(&self, event: RegistryEvent) {
        let Some(name) = event.service.data_source_name().map(str::to_string) else {
            return;
        };
        match event.kind {
            RegistryEventKind::Create | RegistryEventKind::Update => {
                if let Err(e) = self.register_service(&event.service).await {
                    warn!(source = %name, error = %e, "Failed to refresh data source");
                }
            }
            RegistryEventKind::Delete => {
                self.remove(&name);
            }
        }
    }
}

/// Registry of live data sources
pub struct ClientsPool {
    discovery: Discovery,
    registry: Arc<dyn ServiceRegistry>,
    cancel: CancellationToken,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl ClientsPool {
    /// Discover the registry's data sources and, when `config.watch` is set,
    /// follow its changes until [`close`](Self::close).
    #[instrument(skip_all)]
    pub async fn new(
        registry: Arc<dyn ServiceRegistry>,
        connector: Arc<dyn BackendConnector>,
        config: PoolConfig,
    ) -> Result<Arc<Self>> {
        let discovery = Discovery {
            state: Arc::new(RwLock::new(PoolState::default())),
            connector,
        };
        {
            let mut state = discovery.state.write();
            for alias in &config.aliases {
                state.aliases.insert(
                    alias.alias.clone(),
                    AliasEntry {
                        target: alias.target.clone(),
                        bucket: alias.bucket.clone(),
                    },
                );
            }
        }

        for spec in &config.sources {
            if let Err(e) = discovery.register(spec).await {
                warn!(source = %spec.name, error = %e, "Skipping configured data source");
            }
        }

        // Subscribe before listing so nothing registered in between is missed
        let events = if config.watch {
            Some(registry.watch().await?)
        } else {
            None
        };

        for service in registry.list_services().await? {
            if service.data_source_name().is_none() {
                continue;
            }
            if let Err(e) = discovery.register_service(&service).await {
                warn!(service = %service.name, error = %e, "Skipping data source");
            }
        }

        discovery.register_well_known(&config);

        let pool = Arc::new(Self {
            discovery,
            registry,
            cancel: CancellationToken::new(),
            watcher: Mutex::new(None),
        });

        if let Some(mut events) = events {
            let discovery = pool.discovery.clone();
            let cancel = pool.cancel.clone();
            let handle = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = events.next() => match event {
                            Some(event) => {
                                debug!(kind = ?event.kind, service = %event.service.name, "Registry event");
                                discovery.apply(event).await;
                            }
                            None => break,
                        },
                    }
                }
                debug!("Registry watcher stopped");
            });
            *pool.watcher.lock() = Some(handle);
        }

        info!(sources = pool.len(), "Clients pool ready");
        Ok(pool)
    }

    /// Resolve a source or alias. Aliases may chain; the first bucket
    /// override met along the chain wins.
    pub fn get_data_source_info(&self, name: &str) -> Result<DsInfo> {
        let state = self.discovery.state.read();
        let mut current = name.to_string();
        let mut bucket: Option<String> = None;
        let mut seen = HashSet::new();

        loop {
            if let Some(info) = state.sources.get(&current) {
                let mut info = info.clone();
                if let Some(bucket) = bucket {
                    info.bucket = bucket;
                }
                return Ok(info);
            }
            let Some(alias) = state.aliases.get(&current) else {
                return Err(CoreError::DataSourceNotFound(name.to_string()));
            };
            if !seen.insert(current.clone()) {
                return Err(CoreError::Internal(format!("alias cycle through {}", current)));
            }
            if bucket.is_none() {
                bucket = alias.bucket.clone();
            }
            current = alias.target.clone();
        }
    }

    pub fn list_data_sources(&self) -> Vec<String> {
        let mut names: Vec<String> = self.discovery.state.read().sources.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.discovery.state.read().sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn register_alias(&self, alias: impl Into<String>, target: impl Into<String>, bucket: Option<String>) {
        self.discovery.state.write().aliases.insert(
            alias.into(),
            AliasEntry {
                target: target.into(),
                bucket,
            },
        );
    }

    /// Register a source directly
    pub async fn register_source(&self, spec: &DataSourceSpec) -> Result<()> {
        self.discovery.register(spec).await
    }

    pub fn remove_source(&self, name: &str) -> bool {
        self.discovery.remove(name)
    }

    /// Re-read the registry, adding new sources and dropping vanished ones
    pub async fn refresh(&self) -> Result<()> {
        let services = self.registry.list_services().await?;
        let mut live = HashSet::new();
        for service in &services {
            let Some(name) = service.data_source_name() else {
                continue;
            };
            live.insert(name.to_string());
            if let Err(e) = self.discovery.register_service(service).await {
                warn!(service = %service.name, error = %e, "Skipping data source");
            }
        }
        self.discovery
            .state
            .write()
            .sources
            .retain(|name, _| live.contains(name));
        Ok(())
    }

    /// Stop following the registry
    pub async fn close(&self) {
        self.cancel.cancel();
        let handle = self.watcher.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("Clients pool closed");
    }
}

impl Drop for ClientsPool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
