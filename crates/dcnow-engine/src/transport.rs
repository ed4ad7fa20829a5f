use std::sync::Arc;

use tokio::sync::{
    broadcast::{self, error::RecvError},
    mpsc,
};

use crate::error::TransportError;

/// Frames and closure observed on a signaling transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Message(Arc<str>),
    Closed,
}

/// Receiving half handed out by [`Transport::subscribe`].
///
/// Shared transports fan out through a bounded broadcast channel and may
/// report [`RecvError::Lagged`]; single-reader transports hand out an
/// unbounded queue that never drops frames.
pub struct Subscription {
    inner: Source,
}

enum Source {
    Broadcast(broadcast::Receiver<TransportEvent>),
    Queue(mpsc::UnboundedReceiver<TransportEvent>),
}

impl Subscription {
    /// Cancel safe: an event is only consumed when this resolves.
    pub async fn recv(&mut self) -> Result<TransportEvent, RecvError> {
        match &mut self.inner {
            Source::Broadcast(rx) => rx.recv().await,
            Source::Queue(rx) => rx.recv().await.ok_or(RecvError::Closed),
        }
    }
}

impl From<broadcast::Receiver<TransportEvent>> for Subscription {
    fn from(rx: broadcast::Receiver<TransportEvent>) -> Self {
        Self {
            inner: Source::Broadcast(rx),
        }
    }
}

impl From<mpsc::UnboundedReceiver<TransportEvent>> for Subscription {
    fn from(rx: mpsc::UnboundedReceiver<TransportEvent>) -> Self {
        Self {
            inner: Source::Queue(rx),
        }
    }
}

/// Bidirectional text channel to the relay.
///
/// Subscribers only see events published after they subscribed; a transport
/// that is already closed reports it through [`Transport::is_closed`].
pub trait Transport: Send + Sync + 'static {
    fn send(&self, frame: String) -> Result<(), TransportError>;

    fn subscribe(&self) -> Subscription;

    fn is_closed(&self) -> bool;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send(&self, frame: String) -> Result<(), TransportError> {
        (**self).send(frame)
    }

    fn subscribe(&self) -> Subscription {
        (**self).subscribe()
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }
}
