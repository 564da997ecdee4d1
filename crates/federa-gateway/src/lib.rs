//! # Federa Gateway
//!
//! Process wiring for the Federa gateway.
//!
//! This crate provides:
//! - **Configuration**: TOML file plus `FEDERA_*` environment overrides
//! - **Startup**: data-source discovery, in-memory collaborators and the
//!   assembled routers
//! - **Shutdown**: the registry watcher is stopped with the process
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │      S3 listener (external)             │
//! └───────────────────┬─────────────────────┘
//!                     │
//! ┌───────────────────▼─────────────────────┐
//! │   Router (path)   │   Router (by uuid)  │
//! ├─────────────────────────────────────────┤
//! │    ClientsPool ─ registry watcher       │
//! ├─────────────────────────────────────────┤
//! │  Object backends (S3 HTTP / memory)     │
//! └─────────────────────────────────────────┘
//! ```

pub mod config;
pub mod server;

pub use config::{ConfigError, GatewayConfig};
pub use server::Gateway;
