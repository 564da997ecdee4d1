//! Federa Gateway - federated S3 gateway core

use clap::Parser;
use federa_gateway::{Gateway, GatewayConfig};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

#[derive(Parser, Debug)]
#[command(name = "federa-gateway")]
#[command(about = "Federated S3 gateway over registry-discovered data sources")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "FEDERA_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, env = "FEDERA_DEBUG")]
    debug: bool,

    /// Serve data sources from memory (data will not persist)
    #[arg(long, env = "FEDERA_MEMORY_STORE")]
    memory_store: bool,

    /// Do not follow registry changes after startup
    #[arg(long)]
    no_watch: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = GatewayConfig::load(args.config.as_deref())?;
    if args.memory_store {
        config.use_memory_store = true;
    }
    if args.no_watch {
        config.watch_registry = false;
    }

    let log_level = if args.debug { "debug" } else { config.log_level.as_str() };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("federa={0},federa_core={0},federa_router={0},federa_gateway={0}", log_level).into());
    let fmt = if config.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    tracing_subscriber::registry().with(fmt).with(filter).init();

    tracing::info!(
        sources = config.sources.len(),
        watch = config.watch_registry,
        "Starting Federa gateway"
    );

    let gateway = Gateway::start(&config).await?;
    tracing::info!("Gateway ready, waiting for shutdown signal");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    gateway.shutdown().await;
    Ok(())
}
