use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use relay_registry::config::load_config;
use relay_registry::daemon;
use relay_registry::registry::Registry;

#[derive(Parser)]
#[command(name = "relay-registry", version, about = "Pull-through blob registry")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve blobs over HTTP
    Serve {
        #[arg(long, env = "RELAY_REGISTRY_CONFIG")]
        config: PathBuf,
        /// Override server.addr
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
    /// Load and validate a config file and its catalog
    Validate {
        #[arg(long, env = "RELAY_REGISTRY_CONFIG")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Serve { config, listen } => {
            let mut config = load_config(&config)?;
            if let Some(addr) = listen {
                config.server.addr = addr;
            }
            let registry = Arc::new(Registry::from_config(&config)?);
            daemon::serve(config.server.addr, registry).await?;
        }
        Command::Validate { config: path } => {
            let config = load_config(&path)?;
            Registry::from_config(&config)?;
            println!(
                "valid: {} (catalog={}, pullthrough={}, mirror={})",
                path.display(),
                config.catalog.path.display(),
                config.pullthrough.enabled,
                config.pullthrough.mirror
            );
        }
    }

    Ok(())
}
