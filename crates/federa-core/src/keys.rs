//! Encryption key service contract

use crate::node::{trim_path, Node};
use crate::{CoreError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use federa_crypto::DekKey;
use tracing::debug;

#[async_trait]
pub trait KeyService: Send + Sync {
    /// Data key of `node`, created on demand when `create` is set.
    /// Keys are bound to the node's location in its data source.
    async fn get_encryption_key(&self, node: &Node, create: bool) -> Result<DekKey>;
}

/// Keys held in memory, one per index path
#[derive(Default)]
pub struct MemoryKeyService {
    keys: DashMap<String, DekKey>,
}

impl MemoryKeyService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[async_trait]
impl KeyService for MemoryKeyService {
    async fn get_encryption_key(&self, node: &Node, create: bool) -> Result<DekKey> {
        let id = trim_path(&node.path);
        if id.is_empty() {
            return Err(CoreError::InvalidArgument("cannot key a node without path".into()));
        }
        if let Some(key) = self.keys.get(id) {
            return Ok(key.clone());
        }
        if !create {
            return Err(CoreError::NodeNotFound(format!("no encryption key for {}", id)));
        }
        let key = self
            .keys
            .entry(id.to_string())
            .or_insert_with(|| {
                debug!(path = %id, "Generated node key");
                DekKey::generate()
            })
            .clone();
        Ok(key)
    }
}
