use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, FmtSubscriber};

use tumbler_engine::memory::{MemoryChain, MemoryRepository, SoftSecretStore};
use tumbler_engine::MixingEngine;
use tumbler_types::config::EngineConfig;

/// Oxide Tumbler Node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Named confy profile holding the engine configuration
    #[arg(long, default_value = "tumbler-node")]
    config_name: String,

    /// Set logging level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Write the default configuration to the profile and exit
    #[arg(long)]
    write_default_config: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct NodeConfig {
    engine: EngineConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;
    // The engine crates log through the `log` facade.
    tracing_log::LogTracer::init()?;

    if args.write_default_config {
        confy::store(&args.config_name, None, NodeConfig::default())?;
        info!("wrote default configuration profile {}", args.config_name);
        return Ok(());
    }

    let config: NodeConfig = confy::load(&args.config_name, None)?;

    // Without real backends the node runs against the in-memory
    // collaborators; production deployments inject their own.
    let repository = MemoryRepository::new();
    let adapter = MemoryChain::new();
    let secrets = SoftSecretStore::new();

    let engine = MixingEngine::new(config.engine, repository, adapter, secrets);
    engine.start().await.map_err(|e| {
        error!("engine failed to start: {}", e);
        anyhow::anyhow!(e)
    })?;
    info!("tumbler node running; ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    engine.shutdown().await;
    Ok(())
}
