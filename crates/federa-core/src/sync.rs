//! Mirrors object changes of one data source into the index

use crate::node::{base_name, join_path, parent_path, MARKER, META_NODE_UUID};
use crate::tree::MemoryTree;
use federa_crypto::streaming::META_UNENCRYPTED_LENGTH;
use federa_objects::{meta_get, ObjectEvent, ObjectObserver};
use std::sync::Arc;
use tracing::debug;

/// Object observer keeping `<ds>/<key>` index entries in step with a bucket
pub struct DataSourceIndexer {
    ds_name: String,
    bucket: String,
    tree: Arc<MemoryTree>,
}

impl DataSourceIndexer {
    pub fn new(ds_name: impl Into<String>, bucket: impl Into<String>, tree: Arc<MemoryTree>) -> Self {
        Self {
            ds_name: ds_name.into(),
            bucket: bucket.into(),
            tree,
        }
    }
}

impl ObjectObserver for DataSourceIndexer {
    fn on_event(&self, event: &ObjectEvent) {
        match event {
            ObjectEvent::Put { bucket, info } if *bucket == self.bucket => {
                let path = join_path(&self.ds_name, &info.key);
                let uuid = meta_get(&info.metadata, META_NODE_UUID);
                if base_name(&path) == MARKER {
                    let node = self.tree.ensure_collection(parent_path(&path), uuid);
                    debug!(path = %node.path, "Indexed collection");
                } else {
                    // encrypted objects are indexed with their plain length
                    let size = meta_get(&info.metadata, META_UNENCRYPTED_LENGTH)
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(info.size as i64);
                    let node = self.tree.upsert_leaf(
                        &path,
                        uuid,
                        size,
                        &info.etag,
                        info.last_modified.timestamp(),
                    );
                    debug!(path = %node.path, uuid = %node.uuid, "Indexed object");
                }
            }
            ObjectEvent::Removed { bucket, key } if *bucket == self.bucket => {
                // collections leave the index through DeleteNode
                if base_name(key) != MARKER {
                    let path = join_path(&self.ds_name, key);
                    if self.tree.get(&path).is_some_and(|n| n.is_leaf()) {
                        self.tree.remove_path(&path);
                    }
                }
            }
            _ => {}
        }
    }
}
