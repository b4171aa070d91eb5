use anyhow::{Context, Result};
use fdxtunnel_server::{app, ServerConfig, ServerController};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("fdxtunnel_server=info")),
        )
        .init();

    let config = ServerConfig::from_env();
    let ctrl = ServerController::new(config.options.clone());
    let app = app::router(ctrl);

    info!(
        "FdxTunnel server on {} (call timeout {:?}, queue capacity {})",
        config.bind, config.options.call_timeout, config.options.queue_capacity
    );

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down...");
        })
        .await?;
    Ok(())
}
