//! FdxTunnel agent: dials the server and executes tunneled HTTP requests.

pub mod config;
pub mod forward;
pub mod pipeline;
pub mod transport;

use fdxtunnel_shared::Result;
use tokio_util::sync::CancellationToken;

pub use config::AgentConfig;
pub use forward::{Forwarded, Forwarder, HttpForwarder};
pub use pipeline::{AgentPipeline, PipelineOptions};

/// Connect to the configured server and service the tunnel until it
/// closes, fails or `cancel` fires.
pub async fn run(config: &AgentConfig, cancel: CancellationToken) -> Result<()> {
    let forwarder = HttpForwarder::new(config.forward_timeout())?;
    let (sink, stream) = transport::connect(&config.server, &config.target).await?;
    let pipeline = AgentPipeline::new(forwarder, config.pipeline_options());
    pipeline.run(sink, stream, cancel).await
}
