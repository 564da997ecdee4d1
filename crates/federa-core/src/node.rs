//! Node model
//!
//! A [`Node`] is the unit every pipeline operation addresses. Resolution state
//! that filters attach to a node lives in typed [`NodeAttr`] slots; arbitrary
//! HTTP passthrough headers go in [`NodeMeta::headers`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Terminal segment of a collection marker object
pub const MARKER: &str = ".__pydio";

/// Object metadata header carrying the node identifier
pub const META_NODE_UUID: &str = "X-Amz-Meta-Pydio-Node-Uuid";

/// Kind of node
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    #[default]
    Leaf,
    Collection,
}

/// Typed resolution attributes carried on a node
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NodeAttr {
    DataSourceName,
    DataSourcePath,
    VersionId,
    Name,
    ContentType,
}

impl NodeAttr {
    pub fn key(&self) -> &'static str {
        match self {
            Self::DataSourceName => "datasource-name",
            Self::DataSourcePath => "datasource-path",
            Self::VersionId => "versionId",
            Self::Name => "name",
            Self::ContentType => "content-type",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMeta {
    pub attrs: BTreeMap<NodeAttr, String>,
    /// Passthrough headers, forwarded untouched
    pub headers: BTreeMap<String, String>,
}

/// The universal addressable unit
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub uuid: String,
    pub path: String,
    pub kind: NodeType,
    /// Size in bytes; `-1` when unknown
    pub size: i64,
    /// Last modification, epoch seconds
    pub mtime: i64,
    pub etag: String,
    pub meta: NodeMeta,
}

impl Node {
    /// A leaf at `path`
    pub fn leaf(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: NodeType::Leaf,
            ..Default::default()
        }
    }

    /// A collection at `path`
    pub fn collection(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: NodeType::Collection,
            ..Default::default()
        }
    }

    /// A node addressed by identifier only
    pub fn with_id(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            ..Default::default()
        }
    }

    pub fn uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = uuid.into();
        self
    }

    pub fn size(mut self, size: i64) -> Self {
        self.size = size;
        self
    }

    pub fn mtime(mut self, mtime: i64) -> Self {
        self.mtime = mtime;
        self
    }

    pub fn etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = etag.into();
        self
    }

    pub fn with_attr(mut self, attr: NodeAttr, value: impl Into<String>) -> Self {
        self.set_attr(attr, value);
        self
    }

    pub fn is_leaf(&self) -> bool {
        self.kind == NodeType::Leaf
    }

    pub fn is_collection(&self) -> bool {
        self.kind == NodeType::Collection
    }

    pub fn attr(&self, attr: NodeAttr) -> Option<&str> {
        self.meta.attrs.get(&attr).map(String::as_str)
    }

    pub fn set_attr(&mut self, attr: NodeAttr, value: impl Into<String>) {
        self.meta.attrs.insert(attr, value.into());
    }

    pub fn clear_attr(&mut self, attr: NodeAttr) -> Option<String> {
        self.meta.attrs.remove(&attr)
    }

    /// Last path segment
    pub fn base_name(&self) -> &str {
        base_name(&self.path)
    }

    /// True for a `.__pydio` collection marker
    pub fn is_marker(&self) -> bool {
        self.base_name() == MARKER
    }
}

/// Strip leading and trailing slashes
pub fn trim_path(path: &str) -> &str {
    path.trim_matches('/')
}

/// Join two path fragments with a single slash, ignoring empty sides
pub fn join_path(base: &str, rel: &str) -> String {
    let base = trim_path(base);
    let rel = trim_path(rel);
    match (base.is_empty(), rel.is_empty()) {
        (true, _) => rel.to_string(),
        (_, true) => base.to_string(),
        _ => format!("{}/{}", base, rel),
    }
}

/// Last segment of a path
pub fn base_name(path: &str) -> &str {
    let path = trim_path(path);
    path.rsplit('/').next().unwrap_or(path)
}

/// Parent of a path; empty for top-level entries
pub fn parent_path(path: &str) -> &str {
    let path = trim_path(path);
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// First segment and the remainder
pub fn split_first(path: &str) -> (&str, &str) {
    let path = trim_path(path);
    match path.find('/') {
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => (path, ""),
    }
}

/// `path` relative to `prefix`, if it lies under it (or equals it)
pub fn strip_prefix_path<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let path = trim_path(path);
    let prefix = trim_path(prefix);
    if prefix.is_empty() {
        return Some(path);
    }
    if path == prefix {
        return Some("");
    }
    path.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_helpers() {
        assert_eq!(join_path("/a/", "b/c"), "a/b/c");
        assert_eq!(join_path("", "b"), "b");
        assert_eq!(join_path("a", ""), "a");
        assert_eq!(base_name("a/b/c.txt"), "c.txt");
        assert_eq!(base_name("top"), "top");
        assert_eq!(parent_path("a/b/c"), "a/b");
        assert_eq!(parent_path("a"), "");
        assert_eq!(split_first("/slug/rest/x"), ("slug", "rest/x"));
        assert_eq!(split_first("slug"), ("slug", ""));
    }

    #[test]
    fn test_strip_prefix_path() {
        assert_eq!(strip_prefix_path("ds/home/alice/x", "ds/home/alice"), Some("x"));
        assert_eq!(strip_prefix_path("ds/home/alice", "ds/home/alice"), Some(""));
        assert_eq!(strip_prefix_path("ds/home/alicex", "ds/home/alice"), None);
        assert_eq!(strip_prefix_path("x/y", ""), Some("x/y"));
    }

    #[test]
    fn test_node_builder_and_attrs() {
        let mut node = Node::leaf("a/b.txt")
            .uuid("u1")
            .size(12)
            .with_attr(NodeAttr::DataSourceName, "ds1");
        assert!(node.is_leaf());
        assert_eq!(node.attr(NodeAttr::DataSourceName), Some("ds1"));
        assert_eq!(node.clear_attr(NodeAttr::DataSourceName).as_deref(), Some("ds1"));
        assert_eq!(node.attr(NodeAttr::DataSourceName), None);
        assert_eq!(node.base_name(), "b.txt");
    }

    #[test]
    fn test_marker_detection() {
        assert!(Node::leaf("a/b/.__pydio").is_marker());
        assert!(!Node::leaf("a/b/file").is_marker());
    }
}
