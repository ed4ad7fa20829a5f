use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use dcnow_wire::{IceCandidate, SessionDescription};

use crate::error::ConnectivityError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectivityState {
    /// States a connection does not recover from during negotiation.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectivityState::Disconnected | ConnectivityState::Failed | ConnectivityState::Closed
        )
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectivityState::New => "new",
            ConnectivityState::Connecting => "connecting",
            ConnectivityState::Connected => "connected",
            ConnectivityState::Disconnected => "disconnected",
            ConnectivityState::Failed => "failed",
            ConnectivityState::Closed => "closed",
        };
        f.write_str(text)
    }
}

/// Data channel creation options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOptions {
    pub label: String,
    pub ordered: bool,
    pub max_retransmits: Option<u16>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            label: "dcnow".to_string(),
            ordered: true,
            max_retransmits: None,
        }
    }
}

#[derive(Debug)]
pub enum ConnectivityEvent<C> {
    /// Local description generation should start.
    NegotiationNeeded,
    /// A gathered local candidate; `None` marks the end of gathering.
    LocalCandidate(Option<IceCandidate>),
    StateChanged(ConnectivityState),
    /// A channel created by the remote side surfaced locally.
    InboundChannel(C),
    ChannelOpen(C),
}

#[async_trait]
pub trait DataChannel: Clone + Send + Sync + 'static {
    fn label(&self) -> &str;

    async fn send(&self, data: Bytes) -> Result<(), ConnectivityError>;

    /// Inbound payloads. Replaces any previous subscriber.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<Bytes>;
}

/// Peer connection driven by the negotiation engine. Clones are handles to
/// the same connection.
#[async_trait]
pub trait Connectivity: Clone + Send + Sync + 'static {
    type Channel: DataChannel;

    /// Event stream for this connection. Replaces any previous subscriber;
    /// dropping the receiver detaches it.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectivityEvent<Self::Channel>>;

    async fn create_channel(&self, options: &ChannelOptions)
        -> Result<Self::Channel, ConnectivityError>;

    async fn create_offer(&self) -> Result<SessionDescription, ConnectivityError>;

    async fn create_answer(&self) -> Result<SessionDescription, ConnectivityError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectivityError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectivityError>;

    async fn add_remote_candidate(&self, candidate: IceCandidate)
        -> Result<(), ConnectivityError>;

    fn connectivity_state(&self) -> ConnectivityState;

    async fn close(&self);
}

/// Creates fresh connections; holds the primitive's options.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Peer: Connectivity;

    async fn connect(&self) -> Result<Self::Peer, ConnectivityError>;
}
