use anyhow::{Context, Result};
use clap::Parser;
use tokio::{net::TcpListener, signal};
use tracing::info;

use dcnow_relay::{serve, telemetry::Telemetry, AppState, Cli, RelayConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let config = RelayConfig::try_from(Cli::parse())?;
    info!(
        listen_addr = %config.listen_addr,
        min_delay_ms = config.delay.min().as_millis() as u64,
        max_delay_ms = config.delay.max().as_millis() as u64,
        "starting dcnow relay"
    );

    let state = AppState::new(config.delay, Some(telemetry.metrics_handle()));
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("dcnow relay listening on {}", config.listen_addr);

    serve(listener, state, shutdown_signal()).await?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
