//! Command-line parsing and dispatch.

pub mod status;

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bridge::BridgeServer;
use crate::config::{path_display, Config, ConfigOrchestrator};
use crate::logging;
use crate::mcp::{ConfigServerStore, ConnectionManager, TransportConnector};
use crate::services::Backend;

#[derive(Parser)]
#[command(name = "cordage")]
#[command(version)]
#[command(about = "Connection and catalog backend for Model Context Protocol servers")]
#[command(
    long_about = "Cordage keeps connections to the MCP servers listed in its config file and \
caches their tools, prompts and resources. A UI process drives it over the streaming bridge \
on stdin/stdout.\n\n\
Environment Variables:\n\
  RUST_LOG          Log filter; overrides log_level from the config file"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Config file to use instead of the platform default
    #[arg(short = 'c', long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Serve the bridge on stdin/stdout (default)
    Serve,
    /// Connect every configured server and print what it offers
    Status {
        /// Seconds to wait for each catalog
        #[arg(long, value_name = "SECS", default_value_t = 10)]
        wait: u64,
    },
}

pub fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    tokio::runtime::Runtime::new()?.block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<(), Box<dyn Error>> {
    let path = match args.config {
        Some(path) => path,
        None => Config::default_config_path()?,
    };
    let orchestrator = Arc::new(ConfigOrchestrator::new(path));
    let config = orchestrator.load_with_cache()?;
    logging::init(config.log_level.as_deref());

    match args.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(orchestrator, &config).await,
        Commands::Status { wait } => {
            status::run(orchestrator, &config, Duration::from_secs(wait)).await
        }
    }
}

async fn serve(
    orchestrator: Arc<ConfigOrchestrator>,
    config: &Config,
) -> Result<(), Box<dyn Error>> {
    let state_dir = config.resolve_state_dir()?;
    info!(
        config = %path_display(orchestrator.path()),
        state_dir = %path_display(&state_dir),
        "Starting bridge"
    );
    let store = Arc::new(ConfigServerStore::new(orchestrator));
    let connections = ConnectionManager::persistent(
        store,
        Arc::new(TransportConnector::new()?),
        config.mcp.clone(),
        &state_dir,
    );
    let backend = Backend::new(connections.clone());

    let restore = tokio::spawn({
        let connections = connections.clone();
        async move {
            if let Err(err) = connections.activate_all().await {
                warn!(error = %err, "Failed to restore MCP servers");
            }
        }
    });

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Interrupted; shutting down");
                    shutdown.cancel();
                }
                Err(err) => warn!(error = %err, "Cannot listen for Ctrl+C"),
            }
        }
    });

    BridgeServer::new(backend.router())
        .serve(tokio::io::stdin(), tokio::io::stdout(), shutdown)
        .await;

    restore.abort();
    connections.close_all().await;
    connections.flush().await;
    info!("Bridge closed");
    Ok(())
}
