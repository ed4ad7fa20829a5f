//! Decides which side of a pairing this peer plays and runs one negotiation
//! per session key.
//!
//! The relay answers a pairing request with `CONNECTION_ACCEPTED` to the
//! requester, which then answers, and `CONNECTION_REQUEST` to the selected
//! host, which then offers. All sessions share one signaling transport; each
//! negotiation sees it through a per-key view fed by a single reader, so
//! frames that follow a control frame are never lost to a late subscription.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::{
    sync::{broadcast::error::RecvError, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use dcnow_wire::{SessionKey, WireMessage};

use crate::codec::KeyedCodec;
use crate::connectivity::{ChannelOptions, Connectivity, Connector};
use crate::error::{NegotiationError, TransportError};
use crate::machine::Role;
use crate::negotiate::{negotiate, Established, NegotiationConfig};
use crate::transport::{Subscription, Transport, TransportEvent};

const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);
const REJECT_REASON: &str = "peer is not accepting connections";

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub channel: ChannelOptions,
    /// Applied to every negotiation this orchestrator starts.
    pub deadline: Duration,
    /// When false, incoming pairings are answered with `CONNECTION_REJECTED`.
    pub accept_incoming: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            channel: ChannelOptions::default(),
            deadline: DEFAULT_DEADLINE,
            accept_incoming: true,
        }
    }
}

pub struct SessionOutcome<P: Connectivity> {
    pub key: SessionKey,
    pub role: Role,
    pub result: Result<Established<P>, NegotiationError>,
}

pub struct Orchestrator<T: Transport + ?Sized> {
    transport: Arc<T>,
    sessions: Sessions<T>,
    task: JoinHandle<()>,
}

type Sessions<T> = Arc<Mutex<HashMap<SessionKey, Arc<SessionTransport<T>>>>>;

impl<T: Transport + ?Sized> Orchestrator<T> {
    /// Starts reading `transport`. Outcomes of every negotiation, successful
    /// or not, arrive on the returned receiver.
    pub fn start<F>(
        transport: Arc<T>,
        connector: F,
        settings: OrchestratorSettings,
    ) -> (Self, mpsc::UnboundedReceiver<SessionOutcome<F::Peer>>)
    where
        F: Connector + Clone,
    {
        let events = transport.subscribe();
        let sessions: Sessions<T> = Arc::new(Mutex::new(HashMap::new()));
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();

        let dispatcher = Dispatcher {
            transport: Arc::clone(&transport),
            connector,
            settings,
            sessions: Arc::clone(&sessions),
            outcomes: outcomes_tx,
        };
        let task = tokio::spawn(dispatcher.run(events));

        (
            Self {
                transport,
                sessions,
                task,
            },
            outcomes_rx,
        )
    }

    /// Asks the relay to pair this peer with another one.
    pub fn request_connection(&self, payload: Option<Value>) -> Result<(), TransportError> {
        let frame = WireMessage::request(payload).encode()?;
        self.transport.send(frame)
    }

    /// Cuts the session off from the signaling transport; its negotiation
    /// resolves with `TransportClosed`.
    pub fn cancel(&self, key: &SessionKey) -> bool {
        match self.sessions.lock().get(key) {
            Some(view) => {
                view.close();
                true
            }
            None => false,
        }
    }

    pub fn active_sessions(&self) -> Vec<SessionKey> {
        self.sessions.lock().keys().cloned().collect()
    }
}

impl<T: Transport + ?Sized> Drop for Orchestrator<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Dispatcher<T: Transport + ?Sized, F: Connector> {
    transport: Arc<T>,
    connector: F,
    settings: OrchestratorSettings,
    sessions: Sessions<T>,
    outcomes: mpsc::UnboundedSender<SessionOutcome<F::Peer>>,
}

impl<T, F> Dispatcher<T, F>
where
    T: Transport + ?Sized,
    F: Connector + Clone,
{
    async fn run(self, mut events: Subscription) {
        loop {
            let frame = match events.recv().await {
                Ok(TransportEvent::Message(frame)) => frame,
                Ok(TransportEvent::Closed) | Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(skipped)) => {
                    // in-flight sessions may have lost frames they cannot recover
                    warn!(skipped, "orchestrator lagged behind signaling transport; closing active sessions");
                    for view in self.sessions.lock().values() {
                        view.close();
                    }
                    continue;
                }
            };

            let message = match WireMessage::decode(&frame) {
                Ok(message) => message,
                Err(err) => {
                    debug!(error = %err, "ignoring undecodable signaling frame");
                    continue;
                }
            };

            match message {
                WireMessage::ConnectionRequest { key: Some(key), .. } => {
                    if self.settings.accept_incoming {
                        self.start_session(Role::Offerer, key);
                    } else {
                        self.reject(key);
                    }
                }
                WireMessage::ConnectionAccepted { key } => self.start_session(Role::Answerer, key),
                other => {
                    let view = other
                        .key()
                        .and_then(|key| self.sessions.lock().get(key).cloned());
                    if let Some(view) = view {
                        view.deliver(frame);
                    }
                }
            }
        }

        info!("signaling transport closed; closing active sessions");
        for view in self.sessions.lock().values() {
            view.close();
        }
    }

    fn start_session(&self, role: Role, key: SessionKey) {
        let view = {
            let mut sessions = self.sessions.lock();
            if sessions.contains_key(&key) {
                debug!(key = %key, "session already in flight; ignoring duplicate");
                return;
            }
            let view = Arc::new(SessionTransport::new(Arc::clone(&self.transport)));
            sessions.insert(key.clone(), Arc::clone(&view));
            view
        };

        info!(key = %key, role = %role, "starting negotiation");
        let config = NegotiationConfig {
            connector: self.connector.clone(),
            channel: self.settings.channel.clone(),
            signals: KeyedCodec::new(key.clone()),
            deadline: Some(self.settings.deadline),
        };
        let negotiation = negotiate(role, view, config);
        let sessions = Arc::clone(&self.sessions);
        let outcomes = self.outcomes.clone();
        tokio::spawn(async move {
            let result = negotiation.await;
            sessions.lock().remove(&key);
            let _ = outcomes.send(SessionOutcome { key, role, result });
        });
    }

    fn reject(&self, key: SessionKey) {
        info!(key = %key, "rejecting incoming connection");
        let frame = WireMessage::ConnectionRejected {
            key,
            reason: REJECT_REASON.to_string(),
        };
        match frame.encode() {
            Ok(text) => {
                if let Err(err) = self.transport.send(text) {
                    warn!(error = %err, "failed to send rejection");
                }
            }
            Err(err) => warn!(error = %err, "failed to encode rejection"),
        }
    }
}

/// One session's view of the shared signaling transport.
///
/// Frames are queued without bound until the negotiation reads them, so a
/// burst addressed to one session is never dropped. The view has a single
/// subscriber; later subscriptions observe an already closed queue.
struct SessionTransport<T: ?Sized> {
    parent: Arc<T>,
    queue: mpsc::UnboundedSender<TransportEvent>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    closed: AtomicBool,
}

impl<T: Transport + ?Sized> SessionTransport<T> {
    fn new(parent: Arc<T>) -> Self {
        let (queue, inbox) = mpsc::unbounded_channel();
        Self {
            parent,
            queue,
            inbox: Mutex::new(Some(inbox)),
            closed: AtomicBool::new(false),
        }
    }

    fn deliver(&self, frame: Arc<str>) {
        if !self.closed.load(Ordering::SeqCst) {
            let _ = self.queue.send(TransportEvent::Message(frame));
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.queue.send(TransportEvent::Closed);
        }
    }
}

impl<T: Transport + ?Sized> Transport for SessionTransport<T> {
    fn send(&self, frame: String) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.parent.send(frame)
    }

    fn subscribe(&self) -> Subscription {
        match self.inbox.lock().take() {
            Some(inbox) => inbox.into(),
            None => {
                let (_, drained) = mpsc::unbounded_channel();
                drained.into()
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.parent.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryTransport, SimConnector};
    use dcnow_wire::SessionDescription;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn offer_frame(key: &str) -> String {
        WireMessage::description(
            SessionKey::from(key),
            SessionDescription::offer("v=0\r\na=sim-channel:chat\r\n"),
        )
        .encode()
        .expect("encode")
    }

    fn candidate_frame(key: &str, n: usize) -> String {
        WireMessage::IceCandidate {
            key: SessionKey::from(key),
            payload: dcnow_wire::IceCandidate::new(format!("candidate:{n}")),
        }
        .encode()
        .expect("encode")
    }

    fn accepted_frame(key: &str) -> String {
        WireMessage::ConnectionAccepted {
            key: SessionKey::from(key),
        }
        .encode()
        .expect("encode")
    }

    #[tokio::test]
    async fn accepted_pairing_answers_offer_sent_right_behind_it() {
        let (transport, _outbound) = MemoryTransport::new();
        let (orchestrator, mut outcomes) = Orchestrator::start(
            Arc::clone(&transport),
            SimConnector::default(),
            OrchestratorSettings::default(),
        );

        transport.deliver(accepted_frame("k1"));
        transport.deliver(offer_frame("k1"));
        transport.deliver(candidate_frame("k1", 1));

        let outcome = timeout(WAIT, outcomes.recv())
            .await
            .expect("outcome in time")
            .expect("outcome");
        assert_eq!(outcome.key, SessionKey::from("k1"));
        assert_eq!(outcome.role, Role::Answerer);
        let established = outcome.result.expect("established");
        assert_eq!(crate::DataChannel::label(&established.channel), "chat");

        let answered = transport.sent().iter().any(|frame| {
            matches!(
                WireMessage::decode(frame),
                Ok(WireMessage::SdpAnswer { ref key, .. }) if key.as_str() == "k1"
            )
        });
        assert!(answered);
        assert!(orchestrator.active_sessions().is_empty());
    }

    #[tokio::test]
    async fn burst_of_frames_for_one_session_is_not_lost() {
        let (transport, _outbound) = MemoryTransport::new();
        let connector = SimConnector::default();
        let (_orchestrator, mut outcomes) = Orchestrator::start(
            Arc::clone(&transport),
            connector.clone(),
            OrchestratorSettings::default(),
        );

        // published before the negotiation task first runs
        transport.deliver(accepted_frame("burst"));
        transport.deliver(offer_frame("burst"));
        for n in 0..100 {
            transport.deliver(candidate_frame("burst", n));
        }

        let outcome = timeout(WAIT, outcomes.recv())
            .await
            .expect("outcome in time")
            .expect("outcome");
        assert_eq!(outcome.role, Role::Answerer);
        assert!(outcome.result.is_ok());
        let peer = connector.last_peer().expect("peer");
        assert!(peer.rejected_candidates().is_empty());
        assert_eq!(
            peer.applied_candidates().first().map(String::as_str),
            Some("candidate:0")
        );
    }

    #[tokio::test]
    async fn session_view_has_a_single_subscriber() {
        let (transport, _outbound) = MemoryTransport::new();
        let view = SessionTransport::new(transport);
        let mut first = view.subscribe();
        let mut second = view.subscribe();

        view.deliver("frame".into());
        assert!(matches!(
            first.recv().await,
            Ok(TransportEvent::Message(frame)) if &*frame == "frame"
        ));
        assert!(matches!(second.recv().await, Err(RecvError::Closed)));

        view.close();
        view.deliver("late".into());
        assert!(matches!(first.recv().await, Ok(TransportEvent::Closed)));
        assert!(view.send("x".into()).is_err());
    }

    #[tokio::test]
    async fn request_sends_bare_connection_request() {
        let (transport, mut outbound) = MemoryTransport::new();
        let (orchestrator, _outcomes) =
            Orchestrator::start(transport, SimConnector::default(), OrchestratorSettings::default());
        orchestrator.request_connection(None).expect("send");
        let frame = outbound.recv().await.expect("frame");
        assert_eq!(frame, r#"{"type":"CONNECTION_REQUEST"}"#);
    }

    #[tokio::test]
    async fn rejects_incoming_when_configured() {
        let (transport, mut outbound) = MemoryTransport::new();
        let settings = OrchestratorSettings {
            accept_incoming: false,
            ..OrchestratorSettings::default()
        };
        let connector = SimConnector::default();
        let (_orchestrator, _outcomes) =
            Orchestrator::start(Arc::clone(&transport), connector.clone(), settings);

        transport.deliver(
            WireMessage::ConnectionRequest {
                key: Some(SessionKey::from("k2")),
                payload: None,
            }
            .encode()
            .expect("encode"),
        );

        let frame = timeout(WAIT, outbound.recv())
            .await
            .expect("reply in time")
            .expect("frame");
        match WireMessage::decode(&frame).expect("decode") {
            WireMessage::ConnectionRejected { key, reason } => {
                assert_eq!(key.as_str(), "k2");
                assert_eq!(reason, REJECT_REASON);
            }
            other => panic!("unexpected frame {other:?}"),
        }
        assert!(connector.peers().is_empty());
    }

    #[tokio::test]
    async fn cancel_resolves_session_with_transport_closed() {
        let (transport, _outbound) = MemoryTransport::new();
        let (orchestrator, mut outcomes) = Orchestrator::start(
            Arc::clone(&transport),
            SimConnector::default(),
            OrchestratorSettings::default(),
        );
        let key = SessionKey::from("k3");
        transport.deliver(
            WireMessage::ConnectionAccepted { key: key.clone() }
                .encode()
                .expect("encode"),
        );

        timeout(WAIT, async {
            while orchestrator.active_sessions().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("session registered");
        assert!(orchestrator.cancel(&key));

        let outcome = timeout(WAIT, outcomes.recv())
            .await
            .expect("outcome in time")
            .expect("outcome");
        assert_eq!(outcome.result.err(), Some(NegotiationError::TransportClosed));
        assert!(!orchestrator.cancel(&key));
    }

    #[tokio::test]
    async fn transport_closure_fails_every_open_session() {
        let (transport, _outbound) = MemoryTransport::new();
        let (_orchestrator, mut outcomes) = Orchestrator::start(
            Arc::clone(&transport),
            SimConnector::default(),
            OrchestratorSettings::default(),
        );
        for key in ["a", "b"] {
            transport.deliver(
                WireMessage::ConnectionAccepted {
                    key: SessionKey::from(key),
                }
                .encode()
                .expect("encode"),
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        transport.close();

        for _ in 0..2 {
            let outcome = timeout(WAIT, outcomes.recv())
                .await
                .expect("outcome in time")
                .expect("outcome");
            assert_eq!(outcome.result.err(), Some(NegotiationError::TransportClosed));
        }
    }
}
