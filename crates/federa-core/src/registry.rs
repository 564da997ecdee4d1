//! Service registry contract
//!
//! Data sources are advertised as `sync-<name>` services whose metadata
//! carries the object endpoint, the bucket and the encryption flag.

use crate::Result;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use tracing::warn;

/// Name prefix of data-source services
pub const SYNC_SERVICE_PREFIX: &str = "sync-";

pub const META_ENDPOINT: &str = "endpoint";
pub const META_BUCKET: &str = "bucket";
pub const META_ENCRYPTED: &str = "encrypted";

/// A registered service
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ServiceInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// A data-source service advertising `endpoint` and `bucket`
    pub fn data_source(name: &str, endpoint: &str, bucket: &str, encrypted: bool) -> Self {
        Self::new(format!("{}{}", SYNC_SERVICE_PREFIX, name))
            .with_meta(META_ENDPOINT, endpoint)
            .with_meta(META_BUCKET, bucket)
            .with_meta(META_ENCRYPTED, if encrypted { "true" } else { "false" })
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Data-source name for `sync-*` services
    pub fn data_source_name(&self) -> Option<&str> {
        self.name
            .strip_prefix(SYNC_SERVICE_PREFIX)
            .filter(|n| !n.is_empty())
    }

    /// HTTP endpoint of the object service backing this source
    pub fn http_url(&self) -> Option<&str> {
        self.metadata.get(META_ENDPOINT).map(String::as_str)
    }

    pub fn bucket(&self) -> Option<&str> {
        self.metadata.get(META_BUCKET).map(String::as_str)
    }

    pub fn encrypted(&self) -> bool {
        self.metadata
            .get(META_ENCRYPTED)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistryEventKind {
    Create,
    Update,
    Delete,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryEvent {
    pub kind: RegistryEventKind,
    pub service: ServiceInfo,
}

/// Stream of registry events
pub type RegistryStream = BoxStream<'static, RegistryEvent>;

#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    async fn list_services(&self) -> Result<Vec<ServiceInfo>>;

    /// Subscribe to changes made after this call
    async fn watch(&self) -> Result<RegistryStream>;
}

/// In-memory registry broadcasting its changes
pub struct MemoryRegistry {
    services: RwLock<BTreeMap<String, ServiceInfo>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            services: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    /// Register or replace a service, emitting `Create` or `Update`
    pub fn register(&self, service: ServiceInfo) {
        let previous = self
            .services
            .write()
            .insert(service.name.clone(), service.clone());
        let kind = if previous.is_some() {
            RegistryEventKind::Update
        } else {
            RegistryEventKind::Create
        };
        let _ = self.events.send(RegistryEvent { kind, service });
    }

    /// Remove a service, emitting `Delete`
    pub fn deregister(&self, name: &str) -> bool {
        let removed = self.services.write().remove(name);
        match removed {
            Some(service) => {
                let _ = self.events.send(RegistryEvent {
                    kind: RegistryEventKind::Delete,
                    service,
                });
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl ServiceRegistry for MemoryRegistry {
    async fn list_services(&self) -> Result<Vec<ServiceInfo>> {
        Ok(self.services.read().values().cloned().collect())
    }

    async fn watch(&self) -> Result<RegistryStream> {
        let rx = self.events.subscribe();
        Ok(stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "registry watcher lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_source_service() {
        let svc = ServiceInfo::data_source("ds1", "http://s3:9000", "data", true);
        assert_eq!(svc.name, "sync-ds1");
        assert_eq!(svc.data_source_name(), Some("ds1"));
        assert_eq!(svc.http_url(), Some("http://s3:9000"));
        assert_eq!(svc.bucket(), Some("data"));
        assert!(svc.encrypted());
        assert_eq!(ServiceInfo::new("gateway").data_source_name(), None);
    }

    #[tokio::test]
    async fn test_watch_sees_create_update_delete() {
        let registry = MemoryRegistry::new();
        let mut events = registry.watch().await.unwrap();

        registry.register(ServiceInfo::data_source("a", "http://x", "b", false));
        registry.register(ServiceInfo::data_source("a", "http://y", "b", false));
        assert!(registry.deregister("sync-a"));
        assert!(!registry.deregister("sync-a"));

        let kinds: Vec<RegistryEventKind> = vec![
            events.next().await.unwrap().kind,
            events.next().await.unwrap().kind,
            events.next().await.unwrap().kind,
        ];
        assert_eq!(
            kinds,
            vec![
                RegistryEventKind::Create,
                RegistryEventKind::Update,
                RegistryEventKind::Delete
            ]
        );
        assert!(registry.list_services().await.unwrap().is_empty());
    }
}
