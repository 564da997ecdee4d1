//! Per-request context threaded through the filter chain

use crate::{
    tree::{TreeClient, VersionClient},
    workspace::{Principal, Workspace},
    CoreError, Result,
};
use federa_objects::ObjectBackend;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Identifier of a branch: single-node operations use `In`/`Out`,
/// copies and renames use `From`/`To`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BranchKey {
    In,
    Out,
    From,
    To,
}

/// Resolved data source for a branch
#[derive(Clone)]
pub struct DsInfo {
    pub name: String,
    pub client: Arc<dyn ObjectBackend>,
    pub bucket: String,
    pub encrypted: bool,
}

impl DsInfo {
    /// True when both sides talk to the same backend client instance
    pub fn same_client(&self, other: &DsInfo) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.client), Arc::as_ptr(&other.client))
    }
}

impl fmt::Debug for DsInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DsInfo")
            .field("name", &self.name)
            .field("client", &self.client.name())
            .field("bucket", &self.bucket)
            .field("encrypted", &self.encrypted)
            .finish()
    }
}

/// Resolution record for one branch of a request
#[derive(Clone, Debug, Default)]
pub struct BranchInfo {
    pub workspace: Option<Workspace>,
    pub root: Option<crate::node::Node>,
    pub ds: Option<DsInfo>,
    /// Set by the binary-store filter; later filters leave the branch alone
    pub binary: bool,
}

impl BranchInfo {
    pub fn with_workspace(workspace: Workspace) -> Self {
        Self {
            workspace: Some(workspace),
            ..Default::default()
        }
    }

    /// True once a data source has been resolved
    pub fn is_resolved(&self) -> bool {
        self.ds.is_some()
    }
}

/// Request context, cloned by value at every filter boundary
#[derive(Clone)]
pub struct RequestContext {
    request_id: String,
    principal: Option<Principal>,
    workspaces: Option<Arc<Vec<Workspace>>>,
    branches: HashMap<BranchKey, BranchInfo>,
    tree: Option<Arc<dyn TreeClient>>,
    versions: Option<Arc<dyn VersionClient>>,
    cancel: CancellationToken,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            principal: None,
            workspaces: None,
            branches: HashMap::new(),
            tree: None,
            versions: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    pub fn set_principal(&mut self, principal: Principal) {
        self.principal = Some(principal);
    }

    pub fn is_admin(&self) -> bool {
        self.principal.as_ref().is_some_and(|p| p.admin)
    }

    /// Workspaces accessible to the principal, once loaded
    pub fn workspaces(&self) -> Option<&[Workspace]> {
        self.workspaces.as_deref().map(Vec::as_slice)
    }

    pub fn set_workspaces(&mut self, workspaces: Vec<Workspace>) {
        self.workspaces = Some(Arc::new(workspaces));
    }

    pub fn branch(&self, key: BranchKey) -> Option<&BranchInfo> {
        self.branches.get(&key)
    }

    pub fn branch_mut(&mut self, key: BranchKey) -> &mut BranchInfo {
        self.branches.entry(key).or_default()
    }

    pub fn set_branch(&mut self, key: BranchKey, info: BranchInfo) {
        self.branches.insert(key, info);
    }

    /// Resolved data source of a branch
    pub fn ds(&self, key: BranchKey) -> Option<&DsInfo> {
        self.branch(key).and_then(|b| b.ds.as_ref())
    }

    pub fn set_clients(&mut self, tree: Arc<dyn TreeClient>, versions: Arc<dyn VersionClient>) {
        self.tree = Some(tree);
        self.versions = Some(versions);
    }

    pub fn tree(&self) -> Result<Arc<dyn TreeClient>> {
        self.tree
            .clone()
            .ok_or_else(|| CoreError::Internal("tree client not attached to context".into()))
    }

    pub fn versions(&self) -> Result<Arc<dyn VersionClient>> {
        self.versions
            .clone()
            .ok_or_else(|| CoreError::Internal("versions client not attached to context".into()))
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail fast if the request was cancelled
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(CoreError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.request_id)
            .field("principal", &self.principal)
            .field("branches", &self.branches)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use federa_objects::MemoryObjectStore;

    #[test]
    fn test_branch_mut_creates_entry() {
        let mut ctx = RequestContext::new();
        assert!(ctx.branch(BranchKey::In).is_none());
        ctx.branch_mut(BranchKey::In).workspace = Some(Workspace::new("w", "alice"));
        assert_eq!(
            ctx.branch(BranchKey::In).and_then(|b| b.workspace.as_ref()).map(|w| w.slug.as_str()),
            Some("alice")
        );
    }

    #[test]
    fn test_clone_is_independent() {
        let mut ctx = RequestContext::new();
        let copy = ctx.clone();
        ctx.branch_mut(BranchKey::Out).binary = true;
        assert!(copy.branch(BranchKey::Out).is_none());
        assert_eq!(copy.request_id(), ctx.request_id());
    }

    #[test]
    fn test_same_client_uses_identity() {
        let store: Arc<dyn ObjectBackend> = Arc::new(MemoryObjectStore::new("a"));
        let other: Arc<dyn ObjectBackend> = Arc::new(MemoryObjectStore::new("a"));
        let a = DsInfo { name: "a".into(), client: store.clone(), bucket: "b".into(), encrypted: false };
        let b = DsInfo { name: "b".into(), client: store, bucket: "c".into(), encrypted: false };
        let c = DsInfo { name: "c".into(), client: other, bucket: "b".into(), encrypted: false };
        assert!(a.same_client(&b));
        assert!(!a.same_client(&c));
    }

    #[test]
    fn test_cancellation() {
        let ctx = RequestContext::new();
        assert!(ctx.check_cancelled().is_ok());
        ctx.cancellation().cancel();
        assert!(matches!(ctx.check_cancelled(), Err(CoreError::Cancelled)));
    }

    #[test]
    fn test_tree_missing_is_internal() {
        assert!(RequestContext::new().tree().is_err());
    }
}
