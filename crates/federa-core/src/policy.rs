//! Policy checks consumed by the authorization filter

use crate::workspace::Principal;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// S3 actions the gateway asks about
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    GetObject,
    PutObject,
    DeleteObject,
    ListBucket,
    GetBucketNotification,
    PutBucketNotification,
    ListenBucketNotification,
    ListBucketMultipartUploads,
    ListMultipartUploadParts,
    AbortMultipartUpload,
    GetBucketLocation,
    /// Matches every action
    All,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GetObject => "s3:GetObject",
            Self::PutObject => "s3:PutObject",
            Self::DeleteObject => "s3:DeleteObject",
            Self::ListBucket => "s3:ListBucket",
            Self::GetBucketNotification => "s3:GetBucketNotification",
            Self::PutBucketNotification => "s3:PutBucketNotification",
            Self::ListenBucketNotification => "s3:ListenBucketNotification",
            Self::ListBucketMultipartUploads => "s3:ListBucketMultipartUploads",
            Self::ListMultipartUploadParts => "s3:ListMultipartUploadParts",
            Self::AbortMultipartUpload => "s3:AbortMultipartUpload",
            Self::GetBucketLocation => "s3:GetBucketLocation",
            Self::All => "s3:*",
        }
    }

    /// Whether a rule naming `self` covers `action`
    pub fn covers(&self, action: Action) -> bool {
        *self == Action::All || *self == action
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct PolicyRequest {
    pub action: Action,
    pub bucket: String,
    pub object: String,
    pub principal: Option<Principal>,
    pub conditions: BTreeMap<String, String>,
}

impl PolicyRequest {
    pub fn new(action: Action, bucket: impl Into<String>, object: impl Into<String>) -> Self {
        Self {
            action,
            bucket: bucket.into(),
            object: object.into(),
            principal: None,
            conditions: BTreeMap::new(),
        }
    }

    pub fn with_principal(mut self, principal: Option<Principal>) -> Self {
        self.principal = principal;
        self
    }
}

#[async_trait]
pub trait PolicyChecker: Send + Sync {
    async fn is_allowed(&self, request: &PolicyRequest) -> Result<bool>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Login the rule applies to; `None` matches every principal
    pub login: Option<String>,
    pub actions: Vec<Action>,
    pub allow: bool,
}

/// Rule list evaluated deny-first, falling back to a default decision.
/// Admin principals are always allowed.
#[derive(Clone, Debug, Default)]
pub struct StaticPolicy {
    rules: Vec<PolicyRule>,
    default_allow: bool,
}

impl StaticPolicy {
    pub fn allow_all() -> Self {
        Self {
            rules: Vec::new(),
            default_allow: true,
        }
    }

    pub fn deny_all() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, rule: PolicyRule) -> Self {
        self.rules.push(rule);
        self
    }

    fn matching<'a>(&'a self, request: &'a PolicyRequest) -> impl Iterator<Item = &'a PolicyRule> + 'a {
        let login = request.principal.as_ref().map(|p| p.login.as_str());
        self.rules.iter().filter(move |rule| {
            let who = match (&rule.login, login) {
                (None, _) => true,
                (Some(l), Some(login)) => l == login,
                (Some(_), None) => false,
            };
            who && rule.actions.iter().any(|a| a.covers(request.action))
        })
    }
}

#[async_trait]
impl PolicyChecker for StaticPolicy {
    async fn is_allowed(&self, request: &PolicyRequest) -> Result<bool> {
        if request.principal.as_ref().is_some_and(|p| p.admin) {
            return Ok(true);
        }
        let mut allowed = None;
        for rule in self.matching(request) {
            if !rule.allow {
                return Ok(false);
            }
            allowed = Some(true);
        }
        Ok(allowed.unwrap_or(self.default_allow))
    }
}
