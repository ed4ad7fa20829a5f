use dcnow_wire::{IceCandidate, SessionDescription, SessionKey, WireError, WireMessage};
use tracing::trace;

/// What an inbound frame means to one negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    Description(SessionDescription),
    Candidate(IceCandidate),
    Rejected(String),
    Ignored,
}

/// Encodes outbound handshake frames and classifies inbound ones.
pub trait SignalCodec: Send + Sync + 'static {
    fn encode_description(&self, description: &SessionDescription) -> Result<String, WireError>;

    fn encode_candidate(&self, candidate: &IceCandidate) -> Result<String, WireError>;

    fn classify(&self, frame: &str) -> Classified;

    /// Session this codec is bound to, for logging.
    fn session_key(&self) -> Option<&SessionKey> {
        None
    }
}

/// The relay wire schema, bound to one session key.
#[derive(Debug, Clone)]
pub struct KeyedCodec {
    key: SessionKey,
}

impl KeyedCodec {
    pub fn new(key: SessionKey) -> Self {
        Self { key }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }
}

impl SignalCodec for KeyedCodec {
    fn encode_description(&self, description: &SessionDescription) -> Result<String, WireError> {
        WireMessage::description(self.key.clone(), description.clone()).encode()
    }

    fn encode_candidate(&self, candidate: &IceCandidate) -> Result<String, WireError> {
        WireMessage::IceCandidate {
            key: self.key.clone(),
            payload: candidate.clone(),
        }
        .encode()
    }

    fn classify(&self, frame: &str) -> Classified {
        let message = match WireMessage::decode(frame) {
            Ok(message) => message,
            Err(err) => {
                trace!(target = "negotiation", error = %err, "ignoring undecodable frame");
                return Classified::Ignored;
            }
        };
        if message.key() != Some(&self.key) {
            return Classified::Ignored;
        }
        match message {
            WireMessage::SdpOffer { payload, .. } | WireMessage::SdpAnswer { payload, .. } => {
                Classified::Description(payload)
            }
            WireMessage::IceCandidate { payload, .. } => Classified::Candidate(payload),
            WireMessage::ConnectionRejected { reason, .. } => Classified::Rejected(reason),
            WireMessage::ConnectionRequest { .. } | WireMessage::ConnectionAccepted { .. } => {
                Classified::Ignored
            }
        }
    }

    fn session_key(&self) -> Option<&SessionKey> {
        Some(&self.key)
    }
}
