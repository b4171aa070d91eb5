use anyhow::{Context, Result};
use clap::Parser;
use fdxtunnel::AgentConfig;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fdxtunnel")]
#[command(author = "FdxTunnel Team")]
#[command(version = "0.1.0")]
#[command(about = "Execute HTTP calls for a server on the far side of a NAT", long_about = None)]
struct Cli {
    /// Server address (host:port or ws:// URL)
    #[arg(short, long)]
    server: Option<String>,

    /// Target identifier (target address commonly) registered to server
    #[arg(short, long)]
    target: Option<String>,

    /// Path to fdxtunnel.yml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Capacity of the request and response queues
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Timeout for each forwarded request, in seconds
    #[arg(long)]
    forward_timeout: Option<u64>,

    /// Maximum number of requests forwarded at once
    #[arg(long)]
    max_in_flight: Option<usize>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// Command-line flags take precedence over the file.
    fn merge(&self, mut config: AgentConfig) -> AgentConfig {
        if let Some(server) = &self.server {
            config.server = server.clone();
        }
        if let Some(target) = &self.target {
            config.target = target.clone();
        }
        if let Some(capacity) = self.queue_capacity {
            config.queue_capacity = capacity;
        }
        if self.forward_timeout.is_some() {
            config.forward_timeout_secs = self.forward_timeout;
        }
        if self.max_in_flight.is_some() {
            config.max_in_flight = self.max_in_flight;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "fdxtunnel=debug" } else { "fdxtunnel=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let file_config = match cli.config.clone().or_else(AgentConfig::find_config) {
        Some(path) => {
            info!("Loading config from {}", path.display());
            AgentConfig::load(&path)?
        }
        None => AgentConfig::default(),
    };
    let config = cli.merge(file_config);
    config.validate()?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down...");
            shutdown.cancel();
        }
    });

    info!("Starting agent for target {} via {}", config.target, config.server);
    if let Err(e) = fdxtunnel::run(&config, cancel).await {
        error!("Tunnel error: {}", e);
        return Err(e).context("Tunnel stopped");
    }
    info!("Tunnel closed");
    Ok(())
}
