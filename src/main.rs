//! Meridian node binary.
//!
//! Usage:
//!   meridian                       # run a node with on-disk storage
//!   meridian node --in-memory     # run a dev node on the memory engine
//!   meridian print-genesis        # show the dev genesis block

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use meridian::config::MeridianConfig;
use meridian::network::{NoopBroadcaster, StaticPeerPool};
use meridian::node::Node;
use meridian::storage::{MemStorage, SledStorage, Storage};
use meridian::ChainParams;

/// Meridian delegated-proof-of-stake blockchain node.
#[derive(Parser, Debug)]
#[command(name = "meridian", version, about)]
struct Cli {
    /// Data directory for configuration and persistent storage.
    #[arg(long, default_value = "./meridian-data", global = true)]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the node (default).
    Node {
        /// Use the in-memory storage engine instead of sled.
        #[arg(long)]
        in_memory: bool,
    },
    /// Print the deterministic development genesis block.
    PrintGenesis,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let params = ChainParams::default();

    match cli.command.unwrap_or(Command::Node { in_memory: false }) {
        Command::PrintGenesis => {
            let bundle = meridian::genesis::dev_genesis(&params);
            let block = &bundle.block;
            println!("id:            {}", block.id);
            println!("height:        {}", block.height);
            println!("transactions:  {}", block.transactions.len());
            println!("total amount:  {}", block.total_amount);
            println!("generator:     {}", block.generator_public_key.to_hex());
            println!("payload hash:  {}", hex::encode(block.payload_hash));
        }
        Command::Node { in_memory } => {
            let config = MeridianConfig::load(&cli.data_dir);
            let storage: Arc<dyn Storage> = if in_memory || config.node.in_memory {
                Arc::new(MemStorage::new())
            } else {
                match SledStorage::open(&cli.data_dir.join("db")) {
                    Ok(storage) => Arc::new(storage),
                    Err(e) => {
                        error!(error = %e, "cannot open storage");
                        std::process::exit(1);
                    }
                }
            };

            let peers = Arc::new(StaticPeerPool::default());
            let node = match Node::new(
                &config,
                params,
                storage,
                peers,
                Arc::new(NoopBroadcaster),
            ) {
                Ok(node) => node,
                Err(e) => {
                    // A corrupt genesis leaves no safe way to continue.
                    error!(error = %e, "node bootstrap failed");
                    std::process::exit(1);
                }
            };

            let token = CancellationToken::new();
            let shutdown = token.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown signal received");
                    shutdown.cancel();
                }
            });

            node.run(token).await;
        }
    }
}
