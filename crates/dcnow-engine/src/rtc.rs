//! [`Connector`] backed by the `webrtc` crate.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::{
    api::APIBuilder,
    data_channel::{
        data_channel_init::RTCDataChannelInit, data_channel_message::DataChannelMessage,
        RTCDataChannel,
    },
    ice_transport::{
        ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
        ice_server::RTCIceServer,
    },
    peer_connection::{
        configuration::RTCConfiguration,
        peer_connection_state::RTCPeerConnectionState,
        sdp::{sdp_type::RTCSdpType, session_description::RTCSessionDescription},
        RTCPeerConnection,
    },
};

use dcnow_wire::{DescriptionKind, IceCandidate, SessionDescription};

use crate::connectivity::{
    ChannelOptions, Connectivity, ConnectivityEvent, ConnectivityState, Connector, DataChannel,
};
use crate::error::ConnectivityError;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

type EventSink = Arc<Mutex<Option<mpsc::UnboundedSender<ConnectivityEvent<RtcChannel>>>>>;

#[derive(Debug, Clone)]
pub struct RtcConnector {
    ice_servers: Vec<String>,
}

impl RtcConnector {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

impl Default for RtcConnector {
    fn default() -> Self {
        Self::new(vec![DEFAULT_STUN_SERVER.to_string()])
    }
}

#[async_trait]
impl Connector for RtcConnector {
    type Peer = RtcPeer;

    async fn connect(&self) -> Result<RtcPeer, ConnectivityError> {
        let api = APIBuilder::new().build();
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|err| ConnectivityError::Setup(err.to_string()))?,
        );
        let sink: EventSink = Arc::new(Mutex::new(None));
        install_handlers(&pc, &sink);
        Ok(RtcPeer { pc, sink })
    }
}

#[derive(Clone)]
pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    sink: EventSink,
}

impl RtcPeer {
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }
}

fn emit(sink: &EventSink, event: ConnectivityEvent<RtcChannel>) {
    if let Some(sender) = sink.lock().as_ref() {
        let _ = sender.send(event);
    }
}

fn install_handlers(pc: &Arc<RTCPeerConnection>, sink: &EventSink) {
    let negotiation_sink = Arc::clone(sink);
    pc.on_negotiation_needed(Box::new(move || {
        let sink = Arc::clone(&negotiation_sink);
        Box::pin(async move {
            emit(&sink, ConnectivityEvent::NegotiationNeeded);
        })
    }));

    let candidate_sink = Arc::clone(sink);
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let sink = Arc::clone(&candidate_sink);
        Box::pin(async move {
            let Some(candidate) = candidate else {
                emit(&sink, ConnectivityEvent::LocalCandidate(None));
                return;
            };
            match candidate.to_json() {
                Ok(init) => emit(
                    &sink,
                    ConnectivityEvent::LocalCandidate(Some(from_candidate_init(init))),
                ),
                Err(err) => warn!(target = "webrtc", error = %err, "failed to serialise local candidate"),
            }
        })
    }));

    let state_sink = Arc::clone(sink);
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let sink = Arc::clone(&state_sink);
        Box::pin(async move {
            debug!(target = "webrtc", state = ?state, "peer connection state changed");
            emit(&sink, ConnectivityEvent::StateChanged(map_state(state)));
        })
    }));

    let channel_sink = Arc::clone(sink);
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let sink = Arc::clone(&channel_sink);
        Box::pin(async move {
            debug!(target = "webrtc", channel = %dc.label(), "inbound data channel");
            emit(
                &sink,
                ConnectivityEvent::InboundChannel(RtcChannel {
                    inner: Arc::clone(&dc),
                }),
            );
            watch_open(&dc, &sink);
        })
    }));
}

/// Reports the channel's open event. Holds the channel weakly so the handler
/// does not keep it alive.
fn watch_open(dc: &Arc<RTCDataChannel>, sink: &EventSink) {
    let weak: Weak<RTCDataChannel> = Arc::downgrade(dc);
    let sink = Arc::clone(sink);
    dc.on_open(Box::new(move || {
        let weak = weak.clone();
        let sink = Arc::clone(&sink);
        Box::pin(async move {
            if let Some(dc) = weak.upgrade() {
                debug!(target = "webrtc", channel = %dc.label(), "data channel open");
                emit(&sink, ConnectivityEvent::ChannelOpen(RtcChannel { inner: dc }));
            }
        })
    }));
}

#[async_trait]
impl Connectivity for RtcPeer {
    type Channel = RtcChannel;

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectivityEvent<RtcChannel>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.sink.lock() = Some(tx);
        rx
    }

    async fn create_channel(&self, options: &ChannelOptions) -> Result<RtcChannel, ConnectivityError> {
        let dc = self
            .pc
            .create_data_channel(&options.label, Some(channel_init(options)))
            .await
            .map_err(|err| ConnectivityError::operation("create_data_channel", err))?;
        watch_open(&dc, &self.sink);
        // The engine acts on the first request only, so asking directly is safe.
        emit(&self.sink, ConnectivityEvent::NegotiationNeeded);
        Ok(RtcChannel { inner: dc })
    }

    async fn create_offer(&self) -> Result<SessionDescription, ConnectivityError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|err| ConnectivityError::operation("create_offer", err))?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, ConnectivityError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|err| ConnectivityError::operation("create_answer", err))?;
        from_rtc_description(answer)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectivityError> {
        self.pc
            .set_local_description(to_rtc_description(description)?)
            .await
            .map_err(|err| ConnectivityError::operation("set_local_description", err))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectivityError> {
        self.pc
            .set_remote_description(to_rtc_description(description)?)
            .await
            .map_err(|err| ConnectivityError::operation("set_remote_description", err))
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectivityError> {
        self.pc
            .add_ice_candidate(to_candidate_init(candidate))
            .await
            .map_err(|err| ConnectivityError::operation("add_ice_candidate", err))
    }

    fn connectivity_state(&self) -> ConnectivityState {
        map_state(self.pc.connection_state())
    }

    async fn close(&self) {
        self.sink.lock().take();
        if let Err(err) = self.pc.close().await {
            warn!(target = "webrtc", error = %err, "failed to close peer connection");
        }
    }
}

#[derive(Clone)]
pub struct RtcChannel {
    inner: Arc<RTCDataChannel>,
}

impl RtcChannel {
    pub fn raw(&self) -> &Arc<RTCDataChannel> {
        &self.inner
    }
}

#[async_trait]
impl DataChannel for RtcChannel {
    fn label(&self) -> &str {
        self.inner.label()
    }

    async fn send(&self, data: Bytes) -> Result<(), ConnectivityError> {
        self.inner
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|err| ConnectivityError::operation("send", err))
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.on_message(Box::new(move |msg: DataChannelMessage| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(msg.data);
            })
        }));
        rx
    }
}

fn channel_init(options: &ChannelOptions) -> RTCDataChannelInit {
    RTCDataChannelInit {
        ordered: Some(options.ordered),
        max_retransmits: options.max_retransmits,
        ..Default::default()
    }
}

fn map_state(state: RTCPeerConnectionState) -> ConnectivityState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectivityState::New,
        RTCPeerConnectionState::Connecting => ConnectivityState::Connecting,
        RTCPeerConnectionState::Connected => ConnectivityState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectivityState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectivityState::Failed,
        RTCPeerConnectionState::Closed => ConnectivityState::Closed,
    }
}

fn to_rtc_description(
    description: SessionDescription,
) -> Result<RTCSessionDescription, ConnectivityError> {
    let parsed = match description.kind {
        DescriptionKind::Offer => RTCSessionDescription::offer(description.sdp),
        DescriptionKind::Answer => RTCSessionDescription::answer(description.sdp),
    };
    parsed.map_err(|err| ConnectivityError::operation("parse_description", err))
}

fn from_rtc_description(
    description: RTCSessionDescription,
) -> Result<SessionDescription, ConnectivityError> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => DescriptionKind::Offer,
        RTCSdpType::Answer => DescriptionKind::Answer,
        other => {
            return Err(ConnectivityError::operation(
                "describe",
                format!("unsupported description type {other:?}"),
            ))
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: description.sdp,
    })
}

fn from_candidate_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_candidate_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}
