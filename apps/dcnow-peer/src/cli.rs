use std::time::Duration;

use anyhow::{ensure, Context};
use clap::Parser;

use dcnow_engine::rtc::DEFAULT_STUN_SERVER;

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub relay_url: String,
    pub connect: bool,
    pub greeting: String,
    pub timeout: Duration,
    pub ice_servers: Vec<String>,
    pub accept_incoming: bool,
}

#[derive(Debug, Parser)]
#[command(
    name = "dcnow-peer",
    author,
    version,
    about = "Negotiates a data channel with another peer through a dcnow relay"
)]
pub struct Cli {
    /// WebSocket URL of the signaling relay.
    #[arg(long, env = "DCNOW_RELAY_URL", default_value = "ws://127.0.0.1:8080")]
    pub relay_url: String,

    /// Ask the relay to pair this peer instead of waiting to be picked.
    #[arg(long, default_value_t = false)]
    pub connect: bool,

    /// Sent over every channel once it opens.
    #[arg(long, default_value = "Hello, World!")]
    pub greeting: String,

    /// Deadline for each negotiation.
    #[arg(long, env = "DCNOW_TIMEOUT_SECS", default_value_t = 30)]
    pub timeout_secs: u64,

    /// STUN/TURN server URL; repeat for several.
    #[arg(long = "ice-server")]
    pub ice_servers: Vec<String>,

    /// Answer incoming pairings with a rejection.
    #[arg(long, default_value_t = false)]
    pub reject_incoming: bool,
}

impl TryFrom<Cli> for PeerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let scheme = cli
            .relay_url
            .split_once("://")
            .map(|(scheme, _)| scheme)
            .with_context(|| format!("invalid relay url: {}", cli.relay_url))?;
        ensure!(
            matches!(scheme, "ws" | "wss"),
            "relay url must use ws:// or wss://, got {}",
            cli.relay_url
        );
        ensure!(cli.timeout_secs > 0, "timeout must be at least one second");

        let ice_servers = if cli.ice_servers.is_empty() {
            vec![DEFAULT_STUN_SERVER.to_string()]
        } else {
            cli.ice_servers
        };

        Ok(PeerConfig {
            relay_url: cli.relay_url,
            connect: cli.connect,
            greeting: cli.greeting,
            timeout: Duration::from_secs(cli.timeout_secs),
            ice_servers,
            accept_incoming: !cli.reject_incoming,
        })
    }
}
