use thiserror::Error;

use crate::connectivity::ConnectivityState;

/// Terminal failure of one negotiation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error("remote peer rejected the connection: {0}")]
    RemoteRejected(String),
    #[error("connectivity lost ({0})")]
    ConnectivityLost(ConnectivityState),
    #[error("signaling transport closed before the channel opened")]
    TransportClosed,
    #[error("negotiation deadline elapsed")]
    Timeout,
    #[error("connectivity primitive failed: {0}")]
    Connectivity(String),
}

impl NegotiationError {
    pub fn label(&self) -> &'static str {
        match self {
            NegotiationError::RemoteRejected(_) => "remote_rejected",
            NegotiationError::ConnectivityLost(_) => "connectivity_lost",
            NegotiationError::TransportClosed => "transport_closed",
            NegotiationError::Timeout => "timeout",
            NegotiationError::Connectivity(_) => "connectivity",
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("signaling transport closed")]
    Closed,
    #[error("signaling setup failed: {0}")]
    Setup(String),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] dcnow_wire::WireError),
}

#[derive(Debug, Error)]
pub enum ConnectivityError {
    #[error("connectivity setup failed: {0}")]
    Setup(String),
    #[error("{operation} failed: {reason}")]
    Operation {
        operation: &'static str,
        reason: String,
    },
    #[error("connection closed")]
    Closed,
}

impl ConnectivityError {
    pub fn operation(operation: &'static str, err: impl std::fmt::Display) -> Self {
        ConnectivityError::Operation {
            operation,
            reason: err.to_string(),
        }
    }
}
