//! Gateway configuration

use federa_core::{AliasConfig, DataSourceSpec, PoolConfig};
use federa_router::{BinaryStoreConfig, RouterOptions, DEFAULT_POLICY_BUCKET};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Environment prefix of every override, e.g. `FEDERA_WATCH_REGISTRY=false`
pub const ENV_PREFIX: &str = "FEDERA";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Gateway process configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Data sources registered at startup
    pub sources: Vec<DataSourceSpec>,
    /// Alias table (`thumbstore`, `docstore-binaries`, `versions`)
    pub aliases: Vec<AliasConfig>,
    /// Source backing the well-known namespaces left out of `aliases`
    pub default_source: Option<String>,
    pub binary_stores: Vec<BinaryStoreConfig>,
    /// Bucket name presented to the policy service
    pub policy_bucket: String,
    /// Follow registry changes after the initial discovery
    pub watch_registry: bool,
    /// Per-request timeout of S3 clients (seconds)
    pub s3_timeout_secs: u64,
    /// Bearer token sent to S3 endpoints
    pub s3_token: Option<String>,
    /// Serve every source from memory (development only)
    pub use_memory_store: bool,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            aliases: Vec::new(),
            default_source: None,
            binary_stores: vec![BinaryStoreConfig::thumbs(), BinaryStoreConfig::docstore()],
            policy_bucket: DEFAULT_POLICY_BUCKET.to_string(),
            watch_registry: true,
            s3_timeout_secs: 60,
            s3_token: None,
            use_memory_store: false,
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl GatewayConfig {
    /// Defaults, then the optional file, then `FEDERA_*` variables
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder().add_source(config::Config::try_from(&Self::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: Self = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Every alias must point at a configured source, unless sources come
    /// from the registry alone
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (i, source) in self.sources.iter().enumerate() {
            if source.name.is_empty() || source.bucket.is_empty() {
                return Err(ConfigError::Invalid(format!("source #{} needs a name and a bucket", i)));
            }
            if self.sources[..i].iter().any(|s| s.name == source.name) {
                return Err(ConfigError::Invalid(format!("duplicate source {}", source.name)));
            }
        }
        if !self.sources.is_empty() {
            for alias in &self.aliases {
                if !self.sources.iter().any(|s| s.name == alias.target) {
                    return Err(ConfigError::Invalid(format!(
                        "alias {} targets unknown source {}",
                        alias.alias, alias.target
                    )));
                }
            }
            if let Some(default) = &self.default_source {
                if !self.sources.iter().any(|s| &s.name == default) {
                    return Err(ConfigError::Invalid(format!("default source {} is not configured", default)));
                }
            }
        }
        for store in &self.binary_stores {
            if store.namespace.is_empty() || store.namespace.contains('/') {
                return Err(ConfigError::Invalid(format!(
                    "binary store namespace {:?} must be a single path segment",
                    store.namespace
                )));
            }
        }
        Ok(())
    }

    pub fn s3_timeout(&self) -> Duration {
        Duration::from_secs(self.s3_timeout_secs)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            watch: self.watch_registry,
            sources: self.sources.clone(),
            aliases: self.aliases.clone(),
            default_source: self.default_source.clone(),
        }
    }

    pub fn router_options(&self) -> RouterOptions {
        RouterOptions {
            binary_stores: self.binary_stores.clone(),
            policy_bucket: self.policy_bucket.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert!(config.watch_registry);
        assert_eq!(config.router_options(), RouterOptions::default());
        assert_eq!(config.s3_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
watch_registry = false
use_memory_store = true

[[sources]]
name = "pydiods1"
endpoint = "http://localhost:9001"
bucket = "data"

[[sources]]
name = "versions-ds"
endpoint = "http://localhost:9001"
bucket = "versions"
encrypted = true

[[aliases]]
alias = "versions"
target = "versions-ds"
"#
        )
        .unwrap();

        let config = GatewayConfig::load(Some(file.path())).unwrap();
        assert!(!config.watch_registry);
        assert!(config.use_memory_store);
        assert_eq!(config.sources.len(), 2);
        assert!(config.sources[1].encrypted);
        let pool = config.pool_config();
        assert_eq!(pool.aliases[0].target, "versions-ds");
        assert_eq!(config.binary_stores.len(), 2);
    }

    #[test]
    fn test_alias_to_unknown_source_is_rejected() {
        let config = GatewayConfig {
            sources: vec![DataSourceSpec::new("ds1", "http://localhost:9001", "data")],
            aliases: vec![AliasConfig {
                alias: federa_core::ALIAS_VERSIONS.to_string(),
                target: "missing".to_string(),
                bucket: None,
            }],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_default_source_must_be_configured() {
        let mut config = GatewayConfig {
            sources: vec![DataSourceSpec::new("ds1", "http://localhost:9001", "data")],
            default_source: Some("ds9".to_string()),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.default_source = Some("ds1".to_string());
        assert!(config.validate().is_ok());
        assert_eq!(config.pool_config().default_source.as_deref(), Some("ds1"));
    }
}
