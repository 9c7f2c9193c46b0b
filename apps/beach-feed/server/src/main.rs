use anyhow::Result;
use beach_feed_server::{
    config::{Cli, ServerConfig, StoreBackend},
    server, telemetry,
};
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = telemetry::Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        in_memory = matches!(config.backend, StoreBackend::Memory { .. }),
        recommender = config.recommender_url.as_deref().unwrap_or("sampling"),
        "starting beach-feed server"
    );

    server::run(config, telemetry.metrics_handle()).await
}
