//! Handshake frames exchanged between peers and the signaling relay.
//!
//! Every frame is a JSON object tagged by `type`. Apart from the initial
//! `CONNECTION_REQUEST`, each frame carries the session key assigned by the
//! relay so both sides can route and filter on it.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub const CONNECTION_REQUEST: &str = "CONNECTION_REQUEST";
pub const CONNECTION_ACCEPTED: &str = "CONNECTION_ACCEPTED";
pub const CONNECTION_REJECTED: &str = "CONNECTION_REJECTED";
pub const SDP_OFFER: &str = "SDP_OFFER";
pub const SDP_ANSWER: &str = "SDP_ANSWER";
pub const ICE_CANDIDATE: &str = "ICE_CANDIDATE";

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Opaque identifier binding two peers' handshake frames together.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionKind {
    Offer,
    Answer,
}

impl fmt::Display for DescriptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DescriptionKind::Offer => f.write_str("offer"),
            DescriptionKind::Answer => f.write_str("answer"),
        }
    }
}

/// Session description in the browser `RTCSessionDescriptionInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: DescriptionKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Connectivity candidate in the browser `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WireMessage {
    /// Sent by a peer without a key to ask for a pairing; forwarded by the
    /// relay to the selected host with the freshly assigned key.
    ConnectionRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<SessionKey>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    ConnectionAccepted {
        key: SessionKey,
    },
    ConnectionRejected {
        key: SessionKey,
        #[serde(default)]
        reason: String,
    },
    SdpOffer {
        key: SessionKey,
        payload: SessionDescription,
    },
    SdpAnswer {
        key: SessionKey,
        payload: SessionDescription,
    },
    IceCandidate {
        key: SessionKey,
        payload: IceCandidate,
    },
}

impl WireMessage {
    pub fn request(payload: Option<Value>) -> Self {
        WireMessage::ConnectionRequest { key: None, payload }
    }

    /// Wraps a description in the frame matching its kind.
    pub fn description(key: SessionKey, payload: SessionDescription) -> Self {
        match payload.kind {
            DescriptionKind::Offer => WireMessage::SdpOffer { key, payload },
            DescriptionKind::Answer => WireMessage::SdpAnswer { key, payload },
        }
    }

    pub fn key(&self) -> Option<&SessionKey> {
        match self {
            WireMessage::ConnectionRequest { key, .. } => key.as_ref(),
            WireMessage::ConnectionAccepted { key }
            | WireMessage::ConnectionRejected { key, .. }
            | WireMessage::SdpOffer { key, .. }
            | WireMessage::SdpAnswer { key, .. }
            | WireMessage::IceCandidate { key, .. } => Some(key),
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            WireMessage::ConnectionRequest { .. } => CONNECTION_REQUEST,
            WireMessage::ConnectionAccepted { .. } => CONNECTION_ACCEPTED,
            WireMessage::ConnectionRejected { .. } => CONNECTION_REJECTED,
            WireMessage::SdpOffer { .. } => SDP_OFFER,
            WireMessage::SdpAnswer { .. } => SDP_ANSWER,
            WireMessage::IceCandidate { .. } => ICE_CANDIDATE,
        }
    }

    pub fn encode(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, WireError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// What the relay reads from a frame. Payloads stay opaque so keyed frames
/// can be forwarded byte for byte.
#[derive(Debug, Clone, Deserialize)]
pub struct RoutingHeader {
    #[serde(rename = "type")]
    pub tag: String,
    #[serde(default)]
    pub key: Option<SessionKey>,
    #[serde(default)]
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    ConnectionRequest,
    /// Frames the relay forwards to the partner bound to their key.
    Keyed,
    /// Frames only the relay emits, or tags nobody knows.
    Other,
}

impl RoutingHeader {
    pub fn parse(text: &str) -> Result<Self, WireError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn kind(&self) -> FrameKind {
        match self.tag.as_str() {
            CONNECTION_REQUEST => FrameKind::ConnectionRequest,
            SDP_OFFER | SDP_ANSWER | ICE_CANDIDATE | CONNECTION_REJECTED => FrameKind::Keyed,
            _ => FrameKind::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepted_frame_matches_wire_shape() {
        let frame = WireMessage::ConnectionAccepted {
            key: SessionKey::from("k1"),
        };
        let value: Value = serde_json::from_str(&frame.encode().expect("encode")).expect("json");
        assert_eq!(value, json!({ "type": "CONNECTION_ACCEPTED", "key": "k1" }));
    }

    #[test]
    fn bare_request_omits_key_and_payload() {
        let text = WireMessage::request(None).encode().expect("encode");
        assert_eq!(text, r#"{"type":"CONNECTION_REQUEST"}"#);
    }

    #[test]
    fn decodes_browser_candidate_with_nulls() {
        let text = r#"{
            "type": "ICE_CANDIDATE",
            "key": "abc",
            "payload": {
                "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0,
                "usernameFragment": null
            }
        }"#;
        let message = WireMessage::decode(text).expect("decode");
        match message {
            WireMessage::IceCandidate { key, payload } => {
                assert_eq!(key.as_str(), "abc");
                assert_eq!(payload.sdp_mid.as_deref(), Some("0"));
                assert_eq!(payload.sdp_mline_index, Some(0));
                assert!(payload.username_fragment.is_none());
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn description_picks_tag_from_kind() {
        let key = SessionKey::from("k");
        let offer = WireMessage::description(key.clone(), SessionDescription::offer("v=0"));
        let answer = WireMessage::description(key, SessionDescription::answer("v=0"));
        assert_eq!(offer.tag(), SDP_OFFER);
        assert_eq!(answer.tag(), SDP_ANSWER);

        let value: Value = serde_json::from_str(&offer.encode().expect("encode")).expect("json");
        assert_eq!(value["payload"]["type"], "offer");
    }

    #[test]
    fn routing_header_tolerates_unknown_payloads() {
        let header = RoutingHeader::parse(r#"{"type":"SDP_OFFER","key":"k","payload":[1,2]}"#)
            .expect("parse");
        assert_eq!(header.kind(), FrameKind::Keyed);
        assert_eq!(header.key, Some(SessionKey::from("k")));

        let header = RoutingHeader::parse(r#"{"type":"PING"}"#).expect("parse");
        assert_eq!(header.kind(), FrameKind::Other);
        assert!(header.key.is_none());
    }

    #[test]
    fn generated_keys_differ() {
        assert_ne!(SessionKey::generate(), SessionKey::generate());
    }
}
