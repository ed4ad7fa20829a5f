use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dcnow_engine::{
    rtc::{RtcConnector, RtcPeer},
    ws::WsTransport,
    ChannelOptions, Connectivity, DataChannel, Established, Orchestrator, OrchestratorSettings,
    SessionKey,
};

mod cli;

use cli::{Cli, PeerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .context("failed to initialise tracing subscriber")?;

    let config = PeerConfig::try_from(Cli::parse())?;
    info!(
        relay_url = %config.relay_url,
        connect = config.connect,
        accept_incoming = config.accept_incoming,
        "starting dcnow peer"
    );

    let transport = WsTransport::connect(&config.relay_url)
        .await
        .with_context(|| format!("failed to reach relay at {}", config.relay_url))?;
    let settings = OrchestratorSettings {
        channel: ChannelOptions::default(),
        deadline: config.timeout,
        accept_incoming: config.accept_incoming,
    };
    let (orchestrator, mut outcomes) = Orchestrator::start(
        Arc::clone(&transport),
        RtcConnector::new(config.ice_servers.clone()),
        settings,
    );

    if config.connect {
        orchestrator
            .request_connection(None)
            .context("failed to send connection request")?;
    }

    let mut open = Vec::new();
    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            outcome = outcomes.recv() => {
                let Some(outcome) = outcome else {
                    info!("signaling closed");
                    if open.is_empty() {
                        break;
                    }
                    let _ = (&mut shutdown).await;
                    break;
                };
                match outcome.result {
                    Ok(established) => {
                        info!(key = %outcome.key, role = %outcome.role, "data channel open");
                        greet(&outcome.key, &established, &config.greeting).await;
                        open.push(established);
                    }
                    Err(err) => {
                        warn!(
                            key = %outcome.key,
                            role = %outcome.role,
                            error = %err,
                            "negotiation failed"
                        );
                    }
                }
            }
            _ = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
        }
    }

    drop(orchestrator);
    transport.close();
    for established in open {
        established.connection.close().await;
    }
    Ok(())
}

async fn greet(key: &SessionKey, established: &Established<RtcPeer>, greeting: &str) {
    let mut inbound = established.channel.subscribe();
    let label = key.to_string();
    tokio::spawn(async move {
        while let Some(data) = inbound.recv().await {
            info!(
                key = %label,
                message = %String::from_utf8_lossy(&data),
                "message received"
            );
        }
    });

    if let Err(err) = established
        .channel
        .send(Bytes::from(greeting.to_owned()))
        .await
    {
        warn!(key = %key, error = %err, "failed to send greeting");
    }
}
