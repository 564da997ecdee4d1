//! # Federa Core
//!
//! Model and collaborators of the Federa gateway.
//!
//! This crate provides:
//! - **Nodes and workspaces**: the addressable units of the namespace and
//!   the per-principal views over them
//! - **Request context**: branch resolution state, principal, cancellation
//! - **Streams and pipes**: typed node streams and in-process byte pipes
//!   between filters
//! - **Clients pool**: data-source discovery and alias resolution over the
//!   service registry
//! - **Collaborator contracts**: tree, versions, keys, policy, registry and
//!   roles, each with an in-memory implementation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            Router / Filters             │
//! ├─────────────────────────────────────────┤
//! │  RequestContext  │  NodeStream  │ Pipe  │
//! ├─────────────────────────────────────────┤
//! │ ClientsPool │ Tree │ Keys │ Policy │ Idm│
//! ├─────────────────────────────────────────┤
//! │        ObjectBackend (per source)       │
//! └─────────────────────────────────────────┘
//! ```

pub mod context;
pub mod error;
pub mod idm;
pub mod keys;
pub mod node;
pub mod pipe;
pub mod policy;
pub mod pool;
pub mod registry;
pub mod stream;
pub mod sync;
pub mod tree;
pub mod workspace;

pub use context::{BranchInfo, BranchKey, DsInfo, RequestContext};
pub use error::{CoreError, ErrorKind, Result, S3ErrorCode};
pub use idm::{MemoryRoleDao, Role, RoleDao, RoleQuery, RoleWorkspaces, WorkspaceProvider};
pub use keys::{KeyService, MemoryKeyService};
pub use node::{Node, NodeAttr, NodeMeta, NodeType, MARKER, META_NODE_UUID};
pub use pipe::{pipe, PipeFailer, PipeReader, PipeWriter};
pub use policy::{Action, PolicyChecker, PolicyRequest, PolicyRule, StaticPolicy};
pub use pool::{
    AliasConfig, BackendConnector, ClientsPool, DataSourceSpec, HttpConnector, MemoryConnector,
    PoolConfig, ALIAS_DOCSTORE_BINARIES, ALIAS_THUMBSTORE, ALIAS_VERSIONS,
};
pub use registry::{
    MemoryRegistry, RegistryEvent, RegistryEventKind, RegistryStream, ServiceInfo, ServiceRegistry,
};
pub use stream::{node_channel, ListNodesResponse, NodeSender, NodeStream, DEFAULT_STREAM_CAPACITY};
pub use sync::DataSourceIndexer;
pub use tree::{
    ListNodesRequest, MemoryTree, MemoryVersions, TreeClient, VersionClient, VersionRecord,
};
pub use workspace::{root_key, Principal, Workspace, ANONYMOUS_LOGIN, ROOT_WORKSPACE};
