//! # Federa Router
//!
//! The request pipeline of the Federa gateway.
//!
//! This crate provides:
//! - **Handler and filter traits**: one operation surface shared by the
//!   router, each filter and the executor
//! - **Resolution filters**: workspace, multi-root and data-source
//!   resolution by path, or by node identifier
//! - **Binary stores**: fixed namespaces served from dedicated sources
//! - **Archives**: members of stored ZIP/TAR files as nodes, collections
//!   packed on the fly
//! - **Encryption, put reservation and versions** on the object path
//! - **Executor**: the terminal stage talking to the tree and the backends
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │                 Router                   │
//! ├──────────────────────────────────────────┤
//! │ auth → binary → workspace → multi-root → │
//! │ datasource → archive → encryption →      │
//! │ put → version                            │
//! ├──────────────────────────────────────────┤
//! │      Executor (tree + object backends)   │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use federa_router::{Handler, Router, RouterOptions, RouterServices};
//!
//! let router = Router::standard(services, RouterOptions::default());
//! let node = router.read_node(ctx, Node::leaf("alice/photos/p.jpg")).await?;
//! ```

pub mod archive;
pub mod executor;
pub mod filter;
pub mod filters;
pub mod handler;
pub mod router;

#[cfg(test)]
mod testing;

pub use archive::{ArchiveEntry, ArchiveFormat, ArchivePath, ArchiveReader, ArchiveWriter};
pub use executor::Executor;
pub use filter::{BranchFilter, BranchResolver, Chain, Filter, Next};
pub use filters::{BinaryStoreConfig, RootCache, DEFAULT_POLICY_BUCKET, TEMPORARY_ETAG};
pub use handler::{CopyRequest, GetRequest, Handler, MultipartCreateRequest, PutRequest};
pub use router::{NodeRewrite, Router, RouterOptions, RouterServices};
