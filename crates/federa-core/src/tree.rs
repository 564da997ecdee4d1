//! Index (tree) service contracts and their in-memory implementations
//!
//! The index maps identifiers to paths. Paths in the index are physical:
//! `<datasource>/<datasource-path>`, and every node the index returns carries
//! the `datasource-name` / `datasource-path` attributes derived from it.

use crate::{
    node::{join_path, parent_path, split_first, trim_path, Node, NodeAttr, NodeType},
    stream::NodeStream,
    CoreError, Result,
};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, instrument};

/// Listing parameters
#[derive(Clone, Debug, Default)]
pub struct ListNodesRequest {
    pub node: Node,
    pub recursive: bool,
    /// Maximum number of nodes; 0 for no limit
    pub limit: usize,
    pub filter_type: Option<NodeType>,
    /// List the versions of `node` instead of its children
    pub versions: bool,
}

impl ListNodesRequest {
    pub fn new(node: Node) -> Self {
        Self {
            node,
            ..Default::default()
        }
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn filter(mut self, kind: NodeType) -> Self {
        self.filter_type = Some(kind);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn versions(mut self, versions: bool) -> Self {
        self.versions = versions;
        self
    }
}

/// Remote index service
#[async_trait]
pub trait TreeClient: Send + Sync {
    /// Read a node by identifier when set, otherwise by path
    async fn read_node(&self, node: &Node) -> Result<Node>;

    /// Create a node, creating missing parent collections
    async fn create_node(&self, node: Node) -> Result<Node>;

    /// Move or update `from` into `to`
    async fn update_node(&self, from: &Node, to: Node) -> Result<Node>;

    /// Delete a node and everything below it
    async fn delete_node(&self, node: &Node) -> Result<()>;

    async fn list_nodes(&self, req: ListNodesRequest) -> Result<NodeStream>;
}

/// One stored version of a leaf
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionRecord {
    pub version_id: String,
    pub mtime: i64,
    pub size: i64,
    pub etag: String,
    pub description: String,
}

/// Versioned surface of the index service
#[async_trait]
pub trait VersionClient: Send + Sync {
    async fn list_versions(&self, node: &Node) -> Result<Vec<VersionRecord>>;

    async fn head_version(&self, node: &Node, version_id: &str) -> Result<VersionRecord>;
}

#[derive(Default)]
struct TreeIndex {
    by_path: BTreeMap<String, Node>,
    by_uuid: HashMap<String, String>,
}

impl TreeIndex {
    fn resolve_path(&self, node: &Node) -> Option<String> {
        if !node.uuid.is_empty() {
            if let Some(path) = self.by_uuid.get(&node.uuid) {
                return Some(path.clone());
            }
            return None;
        }
        let path = trim_path(&node.path);
        self.by_path.contains_key(path).then(|| path.to_string())
    }

    fn insert(&mut self, mut node: Node) -> Node {
        decorate(&mut node);
        self.by_uuid.insert(node.uuid.clone(), node.path.clone());
        self.by_path.insert(node.path.clone(), node.clone());
        node
    }

    fn ensure_parents(&mut self, path: &str) {
        let mut current = String::new();
        for segment in trim_path(path).split('/').filter(|s| !s.is_empty()) {
            current = join_path(&current, segment);
            if !self.by_path.contains_key(&current) {
                let node = Node::collection(current.clone())
                    .uuid(uuid::Uuid::new_v4().to_string())
                    .mtime(Utc::now().timestamp());
                self.insert(node);
            }
        }
    }

    fn subtree_keys(&self, path: &str) -> Vec<String> {
        let prefix = format!("{}/", path);
        let mut keys = vec![path.to_string()];
        keys.extend(
            self.by_path
                .range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&prefix))
                .map(|(k, _)| k.clone()),
        );
        keys
    }

    fn remove_subtree(&mut self, path: &str) -> usize {
        let keys = self.subtree_keys(path);
        let mut removed = 0;
        for key in keys {
            if let Some(node) = self.by_path.remove(&key) {
                self.by_uuid.remove(&node.uuid);
                removed += 1;
            }
        }
        removed
    }
}

/// Set `datasource-name` / `datasource-path` from an index path
fn decorate(node: &mut Node) {
    node.path = trim_path(&node.path).to_string();
    let (ds, rest) = split_first(&node.path);
    if !ds.is_empty() {
        let (ds, rest) = (ds.to_string(), rest.to_string());
        node.set_attr(NodeAttr::DataSourceName, ds);
        node.set_attr(NodeAttr::DataSourcePath, rest);
    }
}

/// In-memory index
#[derive(Default)]
pub struct MemoryTree {
    index: RwLock<TreeIndex>,
}

impl MemoryTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of indexed nodes
    pub fn len(&self) -> usize {
        self.index.read().by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Synchronous lookup by index path
    pub fn get(&self, path: &str) -> Option<Node> {
        self.index.read().by_path.get(trim_path(path)).cloned()
    }

    /// Insert or refresh a leaf at `path`, keeping an existing identifier
    pub fn upsert_leaf(&self, path: &str, uuid: Option<&str>, size: i64, etag: &str, mtime: i64) -> Node {
        let path = trim_path(path).to_string();
        let mut index = self.index.write();
        index.ensure_parents(parent_path(&path));
        // an identifier already bound elsewhere (copied metadata) is not reused
        let uuid = match (index.by_path.get(&path), uuid) {
            (Some(existing), _) => existing.uuid.clone(),
            (None, Some(given)) if !given.is_empty() && !index.by_uuid.contains_key(given) => {
                given.to_string()
            }
            _ => uuid::Uuid::new_v4().to_string(),
        };
        let node = Node::leaf(path).uuid(uuid).size(size).etag(etag).mtime(mtime);
        index.insert(node)
    }

    /// Ensure a collection exists at `path`
    pub fn ensure_collection(&self, path: &str, uuid: Option<&str>) -> Node {
        let path = trim_path(path).to_string();
        let mut index = self.index.write();
        if let Some(existing) = index.by_path.get(&path) {
            return existing.clone();
        }
        index.ensure_parents(parent_path(&path));
        let uuid = uuid
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        index.insert(
            Node::collection(path)
                .uuid(uuid)
                .mtime(Utc::now().timestamp()),
        )
    }

    /// Remove `path` and its subtree; returns the number of removed nodes
    pub fn remove_path(&self, path: &str) -> usize {
        self.index.write().remove_subtree(trim_path(path))
    }
}

#[async_trait]
impl TreeClient for MemoryTree {
    async fn read_node(&self, node: &Node) -> Result<Node> {
        let index = self.index.read();
        index
            .resolve_path(node)
            .and_then(|path| index.by_path.get(&path).cloned())
            .ok_or_else(|| {
                CoreError::NodeNotFound(if node.uuid.is_empty() {
                    node.path.clone()
                } else {
                    node.uuid.clone()
                })
            })
    }

    #[instrument(skip(self, node), fields(path = %node.path))]
    async fn create_node(&self, node: Node) -> Result<Node> {
        let path = trim_path(&node.path).to_string();
        if path.is_empty() {
            return Err(CoreError::InvalidArgument("cannot create the tree root".into()));
        }
        let mut index = self.index.write();
        index.ensure_parents(parent_path(&path));

        if let Some(existing) = index.by_path.get(&path).cloned() {
            if existing.kind != node.kind {
                return Err(CoreError::Conflict(format!(
                    "{} already exists as a {:?}",
                    path, existing.kind
                )));
            }
            let mut updated = existing;
            updated.size = node.size;
            updated.mtime = if node.mtime > 0 { node.mtime } else { updated.mtime };
            updated.etag = node.etag;
            debug!(uuid = %updated.uuid, "refreshed existing node");
            return Ok(index.insert(updated));
        }

        let mut created = node;
        created.path = path;
        if created.uuid.is_empty() {
            created.uuid = uuid::Uuid::new_v4().to_string();
        }
        if created.mtime == 0 {
            created.mtime = Utc::now().timestamp();
        }
        debug!(uuid = %created.uuid, "created node");
        Ok(index.insert(created))
    }

    #[instrument(skip(self, from, to), fields(from = %from.path, to = %to.path))]
    async fn update_node(&self, from: &Node, to: Node) -> Result<Node> {
        let mut index = self.index.write();
        let source = index
            .resolve_path(from)
            .ok_or_else(|| CoreError::NodeNotFound(from.path.clone()))?;
        let target = trim_path(&to.path).to_string();
        if target.is_empty() {
            return Err(CoreError::InvalidArgument("cannot move onto the tree root".into()));
        }

        if source == target {
            let mut node = index
                .by_path
                .get(&source)
                .cloned()
                .ok_or_else(|| CoreError::NodeNotFound(source.clone()))?;
            node.size = to.size;
            node.etag = to.etag;
            if to.mtime > 0 {
                node.mtime = to.mtime;
            }
            return Ok(index.insert(node));
        }
        if target.starts_with(&format!("{}/", source)) {
            return Err(CoreError::InvalidArgument("cannot move a node below itself".into()));
        }

        index.ensure_parents(parent_path(&target));
        let mut moved = None;
        for key in index.subtree_keys(&source) {
            if let Some(mut node) = index.by_path.remove(&key) {
                let suffix = &key[source.len()..];
                node.path = format!("{}{}", target, suffix);
                let inserted = index.insert(node);
                if key == source {
                    moved = Some(inserted);
                }
            }
        }
        moved.ok_or_else(|| CoreError::NodeNotFound(source))
    }

    #[instrument(skip(self, node), fields(path = %node.path))]
    async fn delete_node(&self, node: &Node) -> Result<()> {
        let mut index = self.index.write();
        let path = index
            .resolve_path(node)
            .ok_or_else(|| CoreError::NodeNotFound(node.path.clone()))?;
        let removed = index.remove_subtree(&path);
        debug!(removed, "deleted subtree");
        Ok(())
    }

    async fn list_nodes(&self, req: ListNodesRequest) -> Result<NodeStream> {
        let index = self.index.read();
        let parent = trim_path(&req.node.path).to_string();
        let parent = if req.node.uuid.is_empty() && parent.is_empty() {
            String::new()
        } else {
            let resolved = index
                .resolve_path(&req.node)
                .ok_or_else(|| CoreError::NodeNotFound(req.node.path.clone()))?;
            if let Some(node) = index.by_path.get(&resolved) {
                if node.is_leaf() {
                    return Ok(NodeStream::from_nodes(vec![node.clone()]));
                }
            }
            resolved
        };

        let prefix = if parent.is_empty() {
            String::new()
        } else {
            format!("{}/", parent)
        };
        let mut nodes: Vec<Node> = index
            .by_path
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| req.recursive || parent_path(k) == parent)
            .filter(|(_, n)| req.filter_type.map_or(true, |t| n.kind == t))
            .map(|(_, n)| n.clone())
            .collect();
        if req.limit > 0 {
            nodes.truncate(req.limit);
        }
        Ok(NodeStream::from_nodes(nodes))
    }
}

/// In-memory versioner
#[derive(Default)]
pub struct MemoryVersions {
    versions: DashMap<String, Vec<VersionRecord>>,
}

impl MemoryVersions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a version for the node identified by `node_uuid`
    pub fn add_version(&self, node_uuid: &str, record: VersionRecord) {
        self.versions
            .entry(node_uuid.to_string())
            .or_default()
            .push(record);
    }
}

#[async_trait]
impl VersionClient for MemoryVersions {
    async fn list_versions(&self, node: &Node) -> Result<Vec<VersionRecord>> {
        Ok(self
            .versions
            .get(&node.uuid)
            .map(|v| v.value().clone())
            .unwrap_or_default())
    }

    async fn head_version(&self, node: &Node, version_id: &str) -> Result<VersionRecord> {
        self.versions
            .get(&node.uuid)
            .and_then(|v| v.iter().find(|r| r.version_id == version_id).cloned())
            .ok_or_else(|| CoreError::NodeNotFound(format!("{}@{}", node.uuid, version_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_derives_datasource_attrs() {
        let tree = MemoryTree::new();
        let node = tree
            .create_node(Node::leaf("ds1/home/alice/a.txt").size(3))
            .await
            .unwrap();
        assert!(!node.uuid.is_empty());
        assert_eq!(node.attr(NodeAttr::DataSourceName), Some("ds1"));
        assert_eq!(node.attr(NodeAttr::DataSourcePath), Some("home/alice/a.txt"));
        // parents were created as collections
        assert!(tree.get("ds1/home/alice").unwrap().is_collection());
    }

    #[tokio::test]
    async fn test_read_by_uuid_and_path() {
        let tree = MemoryTree::new();
        let node = tree.create_node(Node::leaf("ds1/x").uuid("u-x")).await.unwrap();
        assert_eq!(tree.read_node(&Node::with_id("u-x")).await.unwrap().path, "ds1/x");
        assert_eq!(tree.read_node(&Node::leaf("/ds1/x/")).await.unwrap().uuid, node.uuid);
        assert!(tree.read_node(&Node::leaf("ds1/missing")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_children_and_recursive() {
        let tree = MemoryTree::new();
        for p in ["ds/a/1", "ds/a/2", "ds/a/sub/3"] {
            tree.create_node(Node::leaf(p)).await.unwrap();
        }
        let children = tree
            .list_nodes(ListNodesRequest::new(Node::collection("ds/a")))
            .await
            .unwrap()
            .collect_nodes()
            .await
            .unwrap();
        assert_eq!(children.len(), 3);

        let leaves = tree
            .list_nodes(
                ListNodesRequest::new(Node::collection("ds/a"))
                    .recursive(true)
                    .filter(NodeType::Leaf),
            )
            .await
            .unwrap()
            .collect_nodes()
            .await
            .unwrap();
        let paths: Vec<_> = leaves.iter().map(|n| n.path.as_str()).collect();
        assert_eq!(paths, vec!["ds/a/1", "ds/a/2", "ds/a/sub/3"]);
    }

    #[tokio::test]
    async fn test_move_subtree() {
        let tree = MemoryTree::new();
        tree.create_node(Node::leaf("ds/a/sub/f")).await.unwrap();
        let moved = tree
            .update_node(&Node::collection("ds/a"), Node::collection("ds/b"))
            .await
            .unwrap();
        assert_eq!(moved.path, "ds/b");
        assert!(tree.get("ds/b/sub/f").is_some());
        assert!(tree.get("ds/a/sub/f").is_none());
        assert_eq!(
            tree.get("ds/b/sub/f").unwrap().attr(NodeAttr::DataSourcePath),
            Some("b/sub/f")
        );
    }

    #[tokio::test]
    async fn test_delete_removes_subtree() {
        let tree = MemoryTree::new();
        tree.create_node(Node::leaf("ds/a/1")).await.unwrap();
        tree.create_node(Node::leaf("ds/a/2")).await.unwrap();
        tree.create_node(Node::leaf("ds/ab")).await.unwrap();
        tree.delete_node(&Node::collection("ds/a")).await.unwrap();
        assert!(tree.get("ds/a/1").is_none());
        assert!(tree.get("ds/ab").is_some());
    }

    #[tokio::test]
    async fn test_create_conflicting_kind() {
        let tree = MemoryTree::new();
        tree.create_node(Node::leaf("ds/f")).await.unwrap();
        let err = tree.create_node(Node::collection("ds/f")).await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[test]
    fn test_upsert_keeps_existing_uuid() {
        let tree = MemoryTree::new();
        let first = tree.upsert_leaf("ds/f", Some("u-1"), 1, "e1", 10);
        let second = tree.upsert_leaf("ds/f", Some("u-2"), 2, "e2", 20);
        assert_eq!(first.uuid, "u-1");
        assert_eq!(second.uuid, "u-1");
        assert_eq!(second.etag, "e2");
    }

    #[tokio::test]
    async fn test_versions() {
        let versions = MemoryVersions::new();
        versions.add_version(
            "u1",
            VersionRecord {
                version_id: "v1".into(),
                mtime: 1,
                size: 10,
                etag: "e".into(),
                description: String::new(),
            },
        );
        let node = Node::with_id("u1");
        assert_eq!(versions.list_versions(&node).await.unwrap().len(), 1);
        assert_eq!(versions.head_version(&node, "v1").await.unwrap().size, 10);
        assert!(versions.head_version(&node, "v2").await.is_err());
    }
}
