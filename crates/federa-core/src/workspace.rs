//! Workspaces and principals

use crate::node::{base_name, Node};
use serde::{Deserialize, Serialize};

/// Identifier and slug of the synthetic admin workspace
pub const ROOT_WORKSPACE: &str = "ROOT";

/// A per-principal view rooted at one or more tree nodes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub uuid: String,
    /// URL-safe, unique per principal
    pub slug: String,
    pub label: String,
    /// Ordered root node identifiers
    pub root_uuids: Vec<String>,
}

impl Workspace {
    pub fn new(uuid: impl Into<String>, slug: impl Into<String>) -> Self {
        let slug = slug.into();
        Self {
            uuid: uuid.into(),
            label: slug.clone(),
            slug,
            root_uuids: Vec::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_roots<I, S>(mut self, roots: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.root_uuids = roots.into_iter().map(Into::into).collect();
        self
    }

    /// The synthetic workspace used for admin principals
    pub fn admin_root() -> Self {
        Self::new(ROOT_WORKSPACE, ROOT_WORKSPACE)
    }

    pub fn is_admin_root(&self) -> bool {
        self.uuid == ROOT_WORKSPACE
    }

    pub fn has_multiple_roots(&self) -> bool {
        self.root_uuids.len() > 1
    }
}

/// Path segment selecting a root inside a multi-root workspace:
/// the first six characters of its identifier, a dash, its name.
pub fn root_key(root: &Node) -> String {
    let prefix: String = root.uuid.chars().take(6).collect();
    let name = root
        .attr(crate::node::NodeAttr::Name)
        .unwrap_or_else(|| base_name(&root.path));
    format!("{}-{}", prefix, name)
}

/// Authenticated (or anonymous) caller
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub uuid: String,
    pub login: String,
    /// Profile name, e.g. `standard`, `shared`, `admin`
    pub profile: String,
    pub admin: bool,
    /// Group and team role identifiers the principal belongs to
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Login of the principal injected for anonymous reads
pub const ANONYMOUS_LOGIN: &str = "anonymous";

impl Principal {
    pub fn user(uuid: impl Into<String>, login: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            login: login.into(),
            profile: "standard".to_string(),
            admin: false,
            roles: Vec::new(),
        }
    }

    pub fn admin(login: impl Into<String>) -> Self {
        let login = login.into();
        Self {
            uuid: login.clone(),
            login,
            profile: "admin".to_string(),
            admin: true,
            roles: Vec::new(),
        }
    }

    pub fn anonymous() -> Self {
        Self {
            uuid: ANONYMOUS_LOGIN.to_string(),
            login: ANONYMOUS_LOGIN.to_string(),
            profile: ANONYMOUS_LOGIN.to_string(),
            admin: false,
            roles: Vec::new(),
        }
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = profile.into();
        self
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_anonymous(&self) -> bool {
        self.login == ANONYMOUS_LOGIN
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeAttr;

    #[test]
    fn test_root_key_uses_uuid_prefix_and_name() {
        let root = Node::collection("ds1/projects/docs").uuid("abcdef123456");
        assert_eq!(root_key(&root), "abcdef-docs");

        let named = root.with_attr(NodeAttr::Name, "Documents");
        assert_eq!(root_key(&named), "abcdef-Documents");
    }

    #[test]
    fn test_root_key_short_uuid() {
        let root = Node::collection("ds/x").uuid("ab");
        assert_eq!(root_key(&root), "ab-x");
    }

    #[test]
    fn test_admin_root_workspace() {
        let ws = Workspace::admin_root();
        assert!(ws.is_admin_root());
        assert!(!Workspace::new("w1", "alice").is_admin_root());
    }
}
