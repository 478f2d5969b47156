//! Starling node binary.
//!
//! Wires configuration, storage, and the consensus core together and runs
//! the service loop until interrupted. Peer transport is an external
//! collaborator; outbound messages are handed to it, inbound ones fed back
//! through the router.

use std::path::PathBuf;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use starling::config::NodeConfig;
use starling::node::Node;

/// Starling consensus node.
#[derive(Parser, Debug)]
#[command(name = "starling", version, about = "Leaderless DAG consensus node")]
struct Cli {
    /// Data directory for persistent storage.
    #[arg(long, default_value = "./starling-data")]
    data_dir: PathBuf,

    /// Override the configured network ID.
    #[arg(long)]
    network_id: Option<u32>,

    /// Override the frontier-vote weight threshold.
    #[arg(long)]
    alpha: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    std::fs::create_dir_all(&cli.data_dir)?;

    let mut config = NodeConfig::load(&cli.data_dir);
    if let Some(network_id) = cli.network_id {
        config.network.network_id = network_id;
    }
    if let Some(alpha) = cli.alpha {
        config.bootstrap.alpha = alpha;
    }

    let node = Node::open(&config, &cli.data_dir)?;
    info!(
        network_id = config.network.network_id,
        chain = %node.aliaser.primary_alias(&node.primary_chain),
        "starling node starting"
    );

    let cancel = node.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            cancel.cancel();
        }
    });

    node.run(|peer, msg| {
        // Transport is out of scope for the core; without one attached,
        // outbound traffic is logged and dropped.
        warn!(%peer, op = %msg.op(), "no transport attached, dropping outbound message");
    })
    .await;

    info!("node stopped");
    Ok(())
}
