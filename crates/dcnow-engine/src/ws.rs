//! Signaling [`Transport`] over a `tokio-tungstenite` WebSocket client.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{error::ProtocolError, Error as WsError, Message},
};
use tracing::{debug, trace, warn};

use crate::error::TransportError;
use crate::transport::{Subscription, Transport, TransportEvent};

const EVENT_BUFFER: usize = 256;

pub struct WsTransport {
    send_tx: mpsc::UnboundedSender<String>,
    events: broadcast::Sender<TransportEvent>,
    closed: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WsTransport {
    pub async fn connect(url: &str) -> Result<Arc<Self>, TransportError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|err| TransportError::Setup(format!("websocket connect failed: {err}")))?;
        debug!(target = "signaling", url, "signaling websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<String>();
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let closed = Arc::new(AtomicBool::new(false));

        let writer_closed = Arc::clone(&closed);
        let writer = tokio::spawn(async move {
            while let Some(text) = send_rx.recv().await {
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            writer_closed.store(true, Ordering::SeqCst);
            let _ = ws_write.close().await;
        });

        let reader_events = events.clone();
        let reader_closed = Arc::clone(&closed);
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => {
                            trace!(target = "signaling", "dropping non-utf8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                debug!(target = "signaling", "signaling websocket closed: {err}");
                            }
                            _ => {
                                warn!(target = "signaling", "signaling websocket error: {err}");
                            }
                        }
                        break;
                    }
                };
                trace!(target = "signaling", len = text.len(), "frame received");
                let _ = reader_events.send(TransportEvent::Message(text.into()));
            }
            reader_closed.store(true, Ordering::SeqCst);
            let _ = reader_events.send(TransportEvent::Closed);
        });

        Ok(Arc::new(Self {
            send_tx,
            events,
            closed,
            tasks: Mutex::new(vec![writer, reader]),
        }))
    }

    /// Closes the socket. Subscribers observe [`TransportEvent::Closed`].
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        let _ = self.events.send(TransportEvent::Closed);
    }
}

impl Transport for WsTransport {
    fn send(&self, frame: String) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.send_tx.send(frame).map_err(|_| TransportError::Closed)
    }

    fn subscribe(&self) -> Subscription {
        self.events.subscribe().into()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}
