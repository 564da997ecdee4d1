//! Roles and the workspaces they grant
//!
//! A principal's effective roles are its own user role, the group and team
//! roles it belongs to, and every role auto-applied to its profile. A
//! workspace is visible when its ACL names one of those roles.

use crate::workspace::{Principal, Workspace};
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::debug;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub uuid: String,
    pub label: String,
    #[serde(default)]
    pub is_team: bool,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub is_user: bool,
    /// Profiles this role applies to automatically
    #[serde(default)]
    pub auto_applies: Vec<String>,
    #[serde(default)]
    pub last_updated: i64,
}

impl Role {
    pub fn new(uuid: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            label: label.into(),
            ..Default::default()
        }
    }

    pub fn team(mut self) -> Self {
        self.is_team = true;
        self
    }

    pub fn group(mut self) -> Self {
        self.is_group = true;
        self
    }

    pub fn user(mut self) -> Self {
        self.is_user = true;
        self
    }

    pub fn auto_apply(mut self, profile: impl Into<String>) -> Self {
        self.auto_applies.push(profile.into());
        self
    }
}

/// Attribute query over roles. Unset fields match everything.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RoleQuery {
    #[serde(default)]
    pub uuids: Vec<String>,
    /// Label pattern, `*` matches any run of characters
    pub label: Option<String>,
    pub is_team: Option<bool>,
    pub is_group: Option<bool>,
    pub is_user: Option<bool>,
    /// Matches roles auto-applied to this profile
    pub auto_applies_to: Option<String>,
    /// Matches roles with (or without) any auto-apply profile
    pub has_auto_apply: Option<bool>,
    #[serde(default)]
    pub offset: usize,
    /// Zero means unlimited
    #[serde(default)]
    pub limit: usize,
}

impl RoleQuery {
    pub fn by_uuids<I, S>(uuids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            uuids: uuids.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn auto_applied_to(profile: impl Into<String>) -> Self {
        Self {
            auto_applies_to: Some(profile.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, role: &Role) -> bool {
        if !self.uuids.is_empty() && !self.uuids.iter().any(|u| *u == role.uuid) {
            return false;
        }
        if let Some(pattern) = &self.label {
            if !glob_match(pattern, &role.label) {
                return false;
            }
        }
        let flags = [
            (self.is_team, role.is_team),
            (self.is_group, role.is_group),
            (self.is_user, role.is_user),
            (self.has_auto_apply, !role.auto_applies.is_empty()),
        ];
        if flags.iter().any(|(want, have)| want.is_some_and(|w| w != *have)) {
            return false;
        }
        if let Some(profile) = &self.auto_applies_to {
            if !role.auto_applies.iter().any(|p| p == profile) {
                return false;
            }
        }
        true
    }
}

fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }
    let (first, rest) = (parts[0], &parts[1..]);
    let Some(mut remaining) = text.strip_prefix(first) else {
        return false;
    };
    let last = rest.len() - 1;
    for (i, part) in rest.iter().enumerate() {
        if i == last {
            return remaining.ends_with(part);
        }
        match remaining.find(part) {
            Some(at) => remaining = &remaining[at + part.len()..],
            None => return false,
        }
    }
    true
}

#[async_trait]
pub trait RoleDao: Send + Sync {
    /// Insert or replace a role; the flag is true when it was created
    async fn add(&self, role: Role) -> Result<(Role, bool)>;

    async fn search(&self, query: &RoleQuery) -> Result<Vec<Role>>;

    async fn count(&self, query: &RoleQuery) -> Result<usize>;

    /// Delete every matching role, returning how many went
    async fn delete(&self, query: &RoleQuery) -> Result<usize>;
}

/// Roles kept in memory, ordered by label then identifier
#[derive(Default)]
pub struct MemoryRoleDao {
    roles: RwLock<BTreeMap<String, Role>>,
}

impl MemoryRoleDao {
    pub fn new() -> Self {
        Self::default()
    }

    fn matching(&self, query: &RoleQuery) -> Vec<Role> {
        let mut roles: Vec<Role> = self
            .roles
            .read()
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        roles.sort_by(|a, b| a.label.cmp(&b.label).then_with(|| a.uuid.cmp(&b.uuid)));
        roles
    }
}

#[async_trait]
impl RoleDao for MemoryRoleDao {
    async fn add(&self, mut role: Role) -> Result<(Role, bool)> {
        if role.uuid.is_empty() {
            role.uuid = uuid::Uuid::new_v4().to_string();
        }
        role.last_updated = Utc::now().timestamp();
        let created = self
            .roles
            .write()
            .insert(role.uuid.clone(), role.clone())
            .is_none();
        debug!(role = %role.uuid, created, "Stored role");
        Ok((role, created))
    }

    async fn search(&self, query: &RoleQuery) -> Result<Vec<Role>> {
        let roles = self.matching(query).into_iter().skip(query.offset);
        Ok(if query.limit > 0 {
            roles.take(query.limit).collect()
        } else {
            roles.collect()
        })
    }

    async fn count(&self, query: &RoleQuery) -> Result<usize> {
        Ok(self.roles.read().values().filter(|r| query.matches(r)).count())
    }

    async fn delete(&self, query: &RoleQuery) -> Result<usize> {
        let mut roles = self.roles.write();
        let before = roles.len();
        roles.retain(|_, r| !query.matches(r));
        Ok(before - roles.len())
    }
}

/// Lists the workspaces a principal may use
#[async_trait]
pub trait WorkspaceProvider: Send + Sync {
    async fn workspaces_for(&self, principal: &Principal) -> Result<Vec<Workspace>>;
}

/// Workspace listing driven by role membership and a workspace ACL
pub struct RoleWorkspaces {
    roles: Arc<dyn RoleDao>,
    workspaces: RwLock<Vec<(Workspace, HashSet<String>)>>,
}

impl RoleWorkspaces {
    pub fn new(roles: Arc<dyn RoleDao>) -> Self {
        Self {
            roles,
            workspaces: RwLock::new(Vec::new()),
        }
    }

    /// Register a workspace, or add grants to an already registered one
    pub fn grant<I, S>(&self, workspace: Workspace, role_uuids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut workspaces = self.workspaces.write();
        let grants = role_uuids.into_iter().map(Into::into);
        match workspaces.iter_mut().find(|(w, _)| w.uuid == workspace.uuid) {
            Some((existing, acl)) => {
                *existing = workspace;
                acl.extend(grants);
            }
            None => workspaces.push((workspace, grants.collect())),
        }
    }

    /// Identifiers of every role the principal holds
    pub async fn principal_roles(&self, principal: &Principal) -> Result<HashSet<String>> {
        let mut held: HashSet<String> = principal.roles.iter().cloned().collect();
        if !principal.uuid.is_empty() {
            held.insert(principal.uuid.clone());
        }
        for role in self
            .roles
            .search(&RoleQuery::auto_applied_to(principal.profile.clone()))
            .await?
        {
            held.insert(role.uuid);
        }
        Ok(held)
    }
}

#[async_trait]
impl WorkspaceProvider for RoleWorkspaces {
    async fn workspaces_for(&self, principal: &Principal) -> Result<Vec<Workspace>> {
        let held = self.principal_roles(principal).await?;
        let visible: Vec<Workspace> = self
            .workspaces
            .read()
            .iter()
            .filter(|(_, acl)| acl.iter().any(|r| held.contains(r)))
            .map(|(w, _)| w.clone())
            .collect();
        debug!(login = %principal.login, count = visible.len(), "Resolved workspaces");
        Ok(visible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> MemoryRoleDao {
        let dao = MemoryRoleDao::new();
        dao.add(Role::new("r-admin", "Admins").group()).await.unwrap();
        dao.add(Role::new("r-eng", "Engineering").team()).await.unwrap();
        dao.add(Role::new("r-ops", "Operations").team()).await.unwrap();
        dao.add(Role::new("u-alice", "alice").user()).await.unwrap();
        dao.add(Role::new("r-std", "Standard users").auto_apply("standard"))
            .await
            .unwrap();
        dao
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("Eng*", "Engineering"));
        assert!(glob_match("*ing", "Engineering"));
        assert!(glob_match("E*g*g", "Engineering"));
        assert!(glob_match("*", ""));
        assert!(!glob_match("Ops*", "Engineering"));
        assert!(!glob_match("alice", "alice2"));
    }

    #[tokio::test]
    async fn test_add_reports_creation() {
        let dao = seeded().await;
        let (_, created) = dao.add(Role::new("r-eng", "Engineers").team()).await.unwrap();
        assert!(!created);
        let (role, created) = dao.add(Role::new("", "Fresh")).await.unwrap();
        assert!(created);
        assert!(!role.uuid.is_empty());
    }

    #[tokio::test]
    async fn test_search_count_and_paging() {
        let dao = seeded().await;
        let teams = RoleQuery {
            is_team: Some(true),
            ..Default::default()
        };
        assert_eq!(dao.count(&teams).await.unwrap(), 2);

        let page = dao
            .search(&RoleQuery {
                offset: 1,
                limit: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        let labels: Vec<&str> = page.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, vec!["Engineering", "Operations"]);

        let labelled = dao
            .search(&RoleQuery {
                label: Some("*ations".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(labelled.len(), 1);
        assert_eq!(labelled[0].uuid, "r-ops");

        let auto = dao
            .search(&RoleQuery {
                has_auto_apply: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(auto.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_by_query() {
        let dao = seeded().await;
        let removed = dao.delete(&RoleQuery::by_uuids(["r-eng", "r-ops", "nope"])).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(dao.count(&RoleQuery::default()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_workspaces_through_roles() {
        let dao = Arc::new(seeded().await);
        let provider = RoleWorkspaces::new(dao);
        provider.grant(Workspace::new("ws-home", "alice").with_roots(["n-1"]), ["u-alice"]);
        provider.grant(Workspace::new("ws-eng", "eng").with_roots(["n-2"]), ["r-eng"]);
        provider.grant(Workspace::new("ws-common", "common").with_roots(["n-3"]), ["r-std"]);

        let alice = Principal::user("u-alice", "alice").with_roles(["r-eng"]);
        let slugs: Vec<String> = provider
            .workspaces_for(&alice)
            .await
            .unwrap()
            .into_iter()
            .map(|w| w.slug)
            .collect();
        assert_eq!(slugs, vec!["alice", "eng", "common"]);

        let bob = Principal::user("u-bob", "bob").with_profile("guest");
        assert!(provider.workspaces_for(&bob).await.unwrap().is_empty());
    }
}
