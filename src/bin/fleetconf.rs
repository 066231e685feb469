//! fleetconf node binary

use clap::{Parser, Subcommand};
use fleetconf::{common::Config, ConfServer, NodeType};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "fleetconf")]
#[command(about = "Versioned client configuration server")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node
    Serve {
        /// TOML config file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Client/op API address
        #[arg(long)]
        client_addr: Option<String>,

        /// Node-to-node API address
        #[arg(long)]
        node_addr: Option<String>,

        /// master or slave
        #[arg(long)]
        node_type: Option<NodeType>,

        /// Node address of the master (slaves only)
        #[arg(long)]
        master_addr: Option<String>,

        /// RocksDB directory (in-memory store if omitted)
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            client_addr,
            node_addr,
            node_type,
            master_addr,
            db,
        } => {
            // File and environment first, CLI flags take priority
            let mut conf = Config::load(config.as_deref())?;
            if let Some(addr) = client_addr {
                conf.client_addr = addr;
            }
            if let Some(addr) = node_addr {
                conf.node_addr = addr;
            }
            if let Some(node_type) = node_type {
                conf.node_type = node_type;
            }
            if master_addr.is_some() {
                conf.master_addr = master_addr;
            }
            if db.is_some() {
                conf.db_path = db;
            }

            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| conf.log_level.clone().into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            ConfServer::new(conf).serve().await?;
        }
        Commands::Version => {
            println!("fleetconf {}", fleetconf::BUILD_INFO);
        }
    }

    Ok(())
}
