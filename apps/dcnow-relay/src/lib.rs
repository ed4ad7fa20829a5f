//! Signaling relay: pairs connected peers under a session key and forwards
//! their negotiation frames to each other.

pub mod config;
pub mod registry;
pub mod server;
pub mod telemetry;

pub use config::{Cli, DelayRange, RelayConfig};
pub use registry::{ConnectionId, PeerRegistry, RelayError};
pub use server::{router, serve, AppState};
