use std::{net::SocketAddr, time::Duration};

use anyhow::{ensure, Context};
use clap::Parser;
use rand::Rng;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub delay: DelayRange,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Parser)]
#[command(
    name = "dcnow-relay",
    author,
    version,
    about = "Signaling relay for data-channel negotiation"
)]
pub struct Cli {
    /// Address to bind the websocket listener to.
    #[arg(long, env = "DCNOW_RELAY_LISTEN_ADDR", default_value = "127.0.0.1:8080")]
    pub listen_addr: String,

    /// Lower bound of the random delay applied to every inbound frame.
    #[arg(long, env = "DCNOW_RELAY_MIN_DELAY_MS", default_value_t = 0)]
    pub min_delay_ms: u64,

    /// Upper bound of the random delay applied to every inbound frame.
    #[arg(long, env = "DCNOW_RELAY_MAX_DELAY_MS", default_value_t = 0)]
    pub max_delay_ms: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "DCNOW_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 1)]
    pub shutdown_grace_secs: u64,
}

impl TryFrom<Cli> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        let delay = DelayRange::new(
            Duration::from_millis(cli.min_delay_ms),
            Duration::from_millis(cli.max_delay_ms),
        )?;
        Ok(RelayConfig {
            listen_addr,
            delay,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

/// Uniform delay applied to each inbound frame before it is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DelayRange {
    min: Duration,
    max: Duration,
}

impl DelayRange {
    pub fn new(min: Duration, max: Duration) -> anyhow::Result<Self> {
        ensure!(
            min <= max,
            "minimum delay {}ms exceeds maximum delay {}ms",
            min.as_millis(),
            max.as_millis()
        );
        Ok(Self { min, max })
    }

    pub fn none() -> Self {
        Self::default()
    }

    /// Frames are routed on the reader task, in arrival order.
    pub fn is_inline(&self) -> bool {
        self.max.is_zero()
    }

    pub fn sample(&self) -> Duration {
        if self.min == self.max {
            return self.min;
        }
        rand::thread_rng().gen_range(self.min..=self.max)
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(min: u64, max: u64) -> Cli {
        Cli {
            listen_addr: "127.0.0.1:0".into(),
            min_delay_ms: min,
            max_delay_ms: max,
            shutdown_grace_secs: 1,
        }
    }

    #[test]
    fn defaults_route_inline() {
        let config = RelayConfig::try_from(Cli::parse_from(["dcnow-relay"])).expect("config");
        assert_eq!(config.listen_addr.port(), 8080);
        assert!(config.delay.is_inline());
        assert_eq!(config.shutdown_grace, Duration::from_secs(1));
    }

    #[test]
    fn inverted_delay_range_is_rejected() {
        let err = RelayConfig::try_from(cli(50, 10)).unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn bad_listen_address_is_rejected() {
        let mut bad = cli(0, 0);
        bad.listen_addr = "not-an-address".into();
        assert!(RelayConfig::try_from(bad).is_err());
    }

    #[test]
    fn samples_stay_within_bounds() {
        let range = DelayRange::new(Duration::from_millis(5), Duration::from_millis(20))
            .expect("range");
        assert!(!range.is_inline());
        for _ in 0..200 {
            let sample = range.sample();
            assert!(sample >= range.min() && sample <= range.max());
        }
    }
}
