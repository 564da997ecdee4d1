//! Filters of the request pipeline, in the order the router stacks them

pub mod archive;
pub mod auth;
pub mod binary;
pub mod datasource;
pub mod encryption;
pub mod multiroot;
pub mod put;
pub mod uuid;
pub mod version;
pub mod workspace;

pub use archive::ArchiveFilter;
pub use auth::{AuthFilter, DEFAULT_POLICY_BUCKET};
pub use binary::{BinaryStoreConfig, BinaryStoreFilter};
pub use datasource::PathDataSourceResolver;
pub use encryption::EncryptionFilter;
pub use multiroot::{MultiRootResolver, RootCache};
pub use put::{PutFilter, TEMPORARY_ETAG};
pub use uuid::{UuidDataSourceResolver, UuidWorkspaceResolver};
pub use version::VersionFilter;
pub use workspace::WorkspaceResolver;
