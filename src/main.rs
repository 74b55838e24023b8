use clap::Parser;
use kube::Client;
use node_maintenance_operator::{run, Config};
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,node_maintenance_operator=debug"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();

    let client = Client::try_default().await?;
    info!(
        "Starting node maintenance controller (drain timeout {}s, {} concurrent evictions)...",
        config.drain_timeout_seconds, config.max_concurrent_evictions
    );

    run(client, config).await
}
