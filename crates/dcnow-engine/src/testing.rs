//! In-memory doubles for the signaling transport and the connectivity
//! primitive, used by this workspace's tests.
//!
//! [`SimPeer`] behaves like a well-behaved peer connection: creating a channel
//! asks for negotiation, applying a local description gathers candidates, and
//! once both descriptions and a remote candidate are applied the connection
//! comes up and the channel opens. It refuses remote candidates before a
//! remote description, which is what real primitives do.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};

use dcnow_wire::{DescriptionKind, IceCandidate, SessionDescription};

use crate::connectivity::{
    ChannelOptions, Connectivity, ConnectivityEvent, ConnectivityState, Connector, DataChannel,
};
use crate::error::{ConnectivityError, TransportError};
use crate::transport::{Subscription, Transport, TransportEvent};

const CHANNEL_MARKER: &str = "a=sim-channel:";

/// Transport whose inbound side is driven by the test.
pub struct MemoryTransport {
    events: broadcast::Sender<TransportEvent>,
    outbound: mpsc::UnboundedSender<String>,
    sent: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl MemoryTransport {
    /// Returns the transport and the stream of frames it sends.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (events, _) = broadcast::channel(256);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            events,
            outbound,
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        (transport, outbound_rx)
    }

    pub fn deliver(&self, frame: impl Into<String>) {
        let frame: String = frame.into();
        let _ = self.events.send(TransportEvent::Message(frame.into()));
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Closed);
        }
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    /// Live subscriptions; drops back once negotiations release their listeners.
    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }
}

impl Transport for MemoryTransport {
    fn send(&self, frame: String) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.sent.lock().push(frame.clone());
        let _ = self.outbound.send(frame);
        Ok(())
    }

    fn subscribe(&self) -> Subscription {
        self.events.subscribe().into()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Forwards every frame from `outbound` into `target`. Frame `n` is held for
/// `delays[n % delays.len()]`, so uneven delays reorder delivery.
pub fn pipe(
    mut outbound: mpsc::UnboundedReceiver<String>,
    target: Arc<MemoryTransport>,
    delays: Vec<Duration>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut index = 0usize;
        while let Some(frame) = outbound.recv().await {
            let delay = if delays.is_empty() {
                Duration::ZERO
            } else {
                delays[index % delays.len()]
            };
            index += 1;
            if delay.is_zero() {
                target.deliver(frame);
            } else {
                let target = Arc::clone(&target);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    target.deliver(frame);
                });
            }
        }
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimCall {
    CreateChannel(String),
    CreateOffer,
    CreateAnswer,
    SetLocal(DescriptionKind),
    SetRemote(DescriptionKind),
    AddCandidate(String),
    Close,
}

#[derive(Debug, Clone)]
pub struct SimOptions {
    /// Local candidates gathered after the local description is applied.
    pub candidates: usize,
    /// Time spent producing an offer or answer.
    pub generation_delay: Duration,
    /// Bring the connection up once both descriptions are applied.
    pub auto_connect: bool,
    /// Remote candidates that must be applied before the connection comes up.
    pub remote_candidates_needed: usize,
    /// Time spent inside [`Connector::connect`].
    pub connect_delay: Duration,
    pub fail_connect: bool,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            candidates: 2,
            generation_delay: Duration::ZERO,
            auto_connect: true,
            remote_candidates_needed: 1,
            connect_delay: Duration::ZERO,
            fail_connect: false,
        }
    }
}

#[derive(Clone, Default)]
pub struct SimConnector {
    options: SimOptions,
    peers: Arc<Mutex<Vec<SimPeer>>>,
}

impl SimConnector {
    pub fn new(options: SimOptions) -> Self {
        Self {
            options,
            peers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every peer this connector has handed out, oldest first.
    pub fn peers(&self) -> Vec<SimPeer> {
        self.peers.lock().clone()
    }

    pub fn last_peer(&self) -> Option<SimPeer> {
        self.peers.lock().last().cloned()
    }
}

#[async_trait]
impl Connector for SimConnector {
    type Peer = SimPeer;

    async fn connect(&self) -> Result<SimPeer, ConnectivityError> {
        if !self.options.connect_delay.is_zero() {
            tokio::time::sleep(self.options.connect_delay).await;
        }
        if self.options.fail_connect {
            return Err(ConnectivityError::Setup("simulated setup failure".into()));
        }
        let peer = SimPeer::new(self.options.clone());
        self.peers.lock().push(peer.clone());
        Ok(peer)
    }
}

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
pub struct SimPeer {
    inner: Arc<SimPeerInner>,
}

struct SimPeerInner {
    id: u64,
    options: SimOptions,
    events: Mutex<Option<mpsc::UnboundedSender<ConnectivityEvent<SimChannel>>>>,
    calls: Mutex<Vec<SimCall>>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    state: Mutex<ConnectivityState>,
    channel: Mutex<Option<SimChannel>>,
    rejected_candidates: Mutex<Vec<String>>,
}

impl SimPeer {
    fn new(options: SimOptions) -> Self {
        Self {
            inner: Arc::new(SimPeerInner {
                id: NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed),
                options,
                events: Mutex::new(None),
                calls: Mutex::new(Vec::new()),
                local: Mutex::new(None),
                remote: Mutex::new(None),
                state: Mutex::new(ConnectivityState::New),
                channel: Mutex::new(None),
                rejected_candidates: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn calls(&self) -> Vec<SimCall> {
        self.inner.calls.lock().clone()
    }

    /// Remote candidates applied, in order.
    pub fn applied_candidates(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                SimCall::AddCandidate(candidate) => Some(candidate),
                _ => None,
            })
            .collect()
    }

    /// Candidates offered before a remote description existed.
    pub fn rejected_candidates(&self) -> Vec<String> {
        self.inner.rejected_candidates.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.state.lock() == ConnectivityState::Closed
    }

    /// Whether an event subscriber is still attached.
    pub fn has_listener(&self) -> bool {
        self.inner
            .events
            .lock()
            .as_ref()
            .map(|sender| !sender.is_closed())
            .unwrap_or(false)
    }

    /// Pushes a scripted event to the current subscriber.
    pub fn emit(&self, event: ConnectivityEvent<SimChannel>) -> bool {
        if let ConnectivityEvent::StateChanged(state) = &event {
            *self.inner.state.lock() = *state;
        }
        match self.inner.events.lock().as_ref() {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        }
    }

    fn record(&self, call: SimCall) {
        self.inner.calls.lock().push(call);
    }

    fn channel_label(&self) -> String {
        self.inner
            .channel
            .lock()
            .as_ref()
            .map(|channel| channel.label().to_string())
            .unwrap_or_default()
    }

    fn maybe_connect(&self) {
        if !self.inner.options.auto_connect {
            return;
        }
        let local_kind = match self.inner.local.lock().as_ref() {
            Some(local) => local.kind,
            None => return,
        };
        let remote_sdp = match self.inner.remote.lock().as_ref() {
            Some(remote) => remote.sdp.clone(),
            None => return,
        };
        if self.applied_candidates().len() < self.inner.options.remote_candidates_needed {
            return;
        }
        if matches!(
            *self.inner.state.lock(),
            ConnectivityState::Connected | ConnectivityState::Closed
        ) {
            return;
        }

        self.emit(ConnectivityEvent::StateChanged(ConnectivityState::Connecting));
        self.emit(ConnectivityEvent::StateChanged(ConnectivityState::Connected));

        match local_kind {
            DescriptionKind::Offer => {
                let channel = self.inner.channel.lock().clone();
                if let Some(channel) = channel {
                    self.emit(ConnectivityEvent::ChannelOpen(channel));
                }
            }
            DescriptionKind::Answer => {
                let label = remote_sdp
                    .lines()
                    .find_map(|line| line.strip_prefix(CHANNEL_MARKER))
                    .unwrap_or("")
                    .to_string();
                let channel = SimChannel::new(label);
                *self.inner.channel.lock() = Some(channel.clone());
                self.emit(ConnectivityEvent::InboundChannel(channel.clone()));
                self.emit(ConnectivityEvent::ChannelOpen(channel));
            }
        }
    }

    async fn generation_pause(&self) {
        let delay = self.inner.options.generation_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Connectivity for SimPeer {
    type Channel = SimChannel;

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectivityEvent<SimChannel>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.events.lock() = Some(tx);
        rx
    }

    async fn create_channel(&self, options: &ChannelOptions) -> Result<SimChannel, ConnectivityError> {
        self.record(SimCall::CreateChannel(options.label.clone()));
        let channel = SimChannel::new(options.label.clone());
        *self.inner.channel.lock() = Some(channel.clone());
        self.emit(ConnectivityEvent::NegotiationNeeded);
        Ok(channel)
    }

    async fn create_offer(&self) -> Result<SessionDescription, ConnectivityError> {
        self.record(SimCall::CreateOffer);
        self.generation_pause().await;
        Ok(SessionDescription::offer(format!(
            "v=0\r\no=sim {}\r\n{}{}\r\n",
            self.inner.id,
            CHANNEL_MARKER,
            self.channel_label()
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectivityError> {
        self.record(SimCall::CreateAnswer);
        let has_offer = matches!(
            self.inner.remote.lock().as_ref(),
            Some(remote) if remote.kind == DescriptionKind::Offer
        );
        if !has_offer {
            return Err(ConnectivityError::operation("create_answer", "no remote offer"));
        }
        self.generation_pause().await;
        Ok(SessionDescription::answer(format!(
            "v=0\r\no=sim {}\r\n",
            self.inner.id
        )))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectivityError> {
        self.record(SimCall::SetLocal(description.kind));
        *self.inner.local.lock() = Some(description);
        for n in 0..self.inner.options.candidates {
            let mut candidate = IceCandidate::new(format!(
                "candidate:{} {} udp 2122260223 127.0.0.1 {} typ host",
                self.inner.id,
                n + 1,
                50000 + n
            ));
            candidate.sdp_mid = Some("0".to_string());
            candidate.sdp_mline_index = Some(0);
            self.emit(ConnectivityEvent::LocalCandidate(Some(candidate)));
        }
        self.emit(ConnectivityEvent::LocalCandidate(None));
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectivityError> {
        self.record(SimCall::SetRemote(description.kind));
        *self.inner.remote.lock() = Some(description);
        self.maybe_connect();
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectivityError> {
        if self.inner.remote.lock().is_none() {
            self.inner
                .rejected_candidates
                .lock()
                .push(candidate.candidate);
            return Err(ConnectivityError::operation(
                "add_remote_candidate",
                "remote description not set",
            ));
        }
        self.record(SimCall::AddCandidate(candidate.candidate));
        self.maybe_connect();
        Ok(())
    }

    fn connectivity_state(&self) -> ConnectivityState {
        *self.inner.state.lock()
    }

    async fn close(&self) {
        self.record(SimCall::Close);
        *self.inner.state.lock() = ConnectivityState::Closed;
        self.inner.events.lock().take();
    }
}

#[derive(Clone)]
pub struct SimChannel {
    label: Arc<str>,
    sent: Arc<Mutex<Vec<Bytes>>>,
    inbound: Arc<Mutex<Option<mpsc::UnboundedSender<Bytes>>>>,
}

impl SimChannel {
    pub fn new(label: impl Into<String>) -> Self {
        let label: String = label.into();
        Self {
            label: label.into(),
            sent: Arc::new(Mutex::new(Vec::new())),
            inbound: Arc::new(Mutex::new(None)),
        }
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    /// Delivers `data` as if the remote side had sent it.
    pub fn push_inbound(&self, data: Bytes) -> bool {
        match self.inbound.lock().as_ref() {
            Some(sender) => sender.send(data).is_ok(),
            None => false,
        }
    }
}

impl std::fmt::Debug for SimChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimChannel")
            .field("label", &self.label)
            .finish()
    }
}

#[async_trait]
impl DataChannel for SimChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, data: Bytes) -> Result<(), ConnectivityError> {
        self.sent.lock().push(data);
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inbound.lock() = Some(tx);
        rx
    }
}
