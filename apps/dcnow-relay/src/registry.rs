//! Connected peers and the sessions pairing them.
//!
//! Peers live in a slab arena; a session key indexes the two connection ids it
//! binds, and each peer record keeps the keys it participates in so a closing
//! peer purges all of them in one step. Ids carry a generation, so a frame
//! routed on behalf of a closed peer is never attributed to whoever reuses its
//! slot.

use std::{
    collections::HashMap,
    fmt,
    sync::Arc,
    time::Instant,
};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use slab::Slab;
use thiserror::Error;
use tokio::sync::mpsc;

use dcnow_wire::{SessionKey, WireError, WireMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    slot: usize,
    generation: u64,
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.slot, self.generation)
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("connection {0} is no longer registered")]
    UnknownPeer(ConnectionId),
    #[error("no other peer is connected")]
    NoPartner,
    #[error("session {0} is not bound to this connection")]
    UnknownSession(SessionKey),
    #[error("partner for session {0} has disconnected")]
    PartnerGone(SessionKey),
    #[error("failed to encode relay frame: {0}")]
    Encode(#[from] WireError),
}

impl RelayError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            RelayError::UnknownPeer(_) => "unknown_peer",
            RelayError::NoPartner => "no_partner",
            RelayError::UnknownSession(_) => "unknown_session",
            RelayError::PartnerGone(_) => "partner_gone",
            RelayError::Encode(_) => "encode",
        }
    }
}

#[derive(Clone, Default)]
pub struct PeerRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

#[derive(Default)]
struct RegistryInner {
    peers: Slab<PeerRecord>,
    sessions: HashMap<SessionKey, (ConnectionId, ConnectionId)>,
    next_generation: u64,
}

struct PeerRecord {
    id: ConnectionId,
    sender: mpsc::UnboundedSender<String>,
    pairings: HashMap<SessionKey, ConnectionId>,
    connected_at: Instant,
}

#[derive(Debug, Clone)]
pub struct Pairing {
    pub key: SessionKey,
    pub requester: ConnectionId,
    pub partner: ConnectionId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Removal {
    pub purged_sessions: usize,
    pub active_peers: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub active_peers: usize,
    pub active_sessions: usize,
    pub peers: Vec<PeerSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerSnapshot {
    pub connection_id: String,
    pub sessions: usize,
    pub connected_for_ms: u64,
}

impl RegistryInner {
    fn record(&self, id: ConnectionId) -> Option<&PeerRecord> {
        self.peers.get(id.slot).filter(|record| record.id == id)
    }

    fn record_mut(&mut self, id: ConnectionId) -> Option<&mut PeerRecord> {
        self.peers.get_mut(id.slot).filter(|record| record.id == id)
    }
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a peer whose outbound frames go to `sender`. The peer starts
    /// unpaired.
    pub fn register(&self, sender: mpsc::UnboundedSender<String>) -> ConnectionId {
        let mut guard = self.inner.lock();
        let generation = guard.next_generation;
        guard.next_generation += 1;
        let entry = guard.peers.vacant_entry();
        let id = ConnectionId {
            slot: entry.key(),
            generation,
        };
        entry.insert(PeerRecord {
            id,
            sender,
            pairings: HashMap::new(),
            connected_at: Instant::now(),
        });
        id
    }

    /// Removes the peer and every session it takes part in, on both sides.
    /// Returns `None` when the id is stale.
    pub fn unregister(&self, id: ConnectionId) -> Option<Removal> {
        let mut guard = self.inner.lock();
        guard.record(id)?;
        let record = guard.peers.remove(id.slot);
        let purged_sessions = record.pairings.len();
        for (key, partner) in record.pairings {
            guard.sessions.remove(&key);
            if let Some(partner) = guard.record_mut(partner) {
                partner.pairings.remove(&key);
            }
        }
        Some(Removal {
            purged_sessions,
            active_peers: guard.peers.len(),
        })
    }

    /// Binds `requester` to the earliest-registered other peer under a fresh
    /// key, then tells the requester it was accepted and forwards the request
    /// to the partner. Peers may take part in any number of sessions.
    pub fn pair(
        &self,
        requester: ConnectionId,
        payload: Option<Value>,
    ) -> Result<Pairing, RelayError> {
        let mut guard = self.inner.lock();
        if guard.record(requester).is_none() {
            return Err(RelayError::UnknownPeer(requester));
        }
        let partner = guard
            .peers
            .iter()
            .map(|(_, record)| record.id)
            .filter(|id| *id != requester)
            .min_by_key(|id| id.generation)
            .ok_or(RelayError::NoPartner)?;

        let mut key = SessionKey::generate();
        while guard.sessions.contains_key(&key) {
            key = SessionKey::generate();
        }
        let accepted = WireMessage::ConnectionAccepted { key: key.clone() }.encode()?;
        let request = WireMessage::ConnectionRequest {
            key: Some(key.clone()),
            payload,
        }
        .encode()?;

        guard.sessions.insert(key.clone(), (requester, partner));
        if let Some(record) = guard.record_mut(requester) {
            record.pairings.insert(key.clone(), partner);
            let _ = record.sender.send(accepted);
        }
        if let Some(record) = guard.record_mut(partner) {
            record.pairings.insert(key.clone(), requester);
            let _ = record.sender.send(request);
        }

        Ok(Pairing {
            key,
            requester,
            partner,
        })
    }

    /// Forwards `frame` unchanged to the partner `from` is bound to under
    /// `key`.
    pub fn route(
        &self,
        from: ConnectionId,
        key: &SessionKey,
        frame: String,
    ) -> Result<ConnectionId, RelayError> {
        let guard = self.inner.lock();
        let sender = guard.record(from).ok_or(RelayError::UnknownPeer(from))?;
        let partner = *sender
            .pairings
            .get(key)
            .ok_or_else(|| RelayError::UnknownSession(key.clone()))?;
        let target = guard
            .record(partner)
            .ok_or_else(|| RelayError::PartnerGone(key.clone()))?;
        target
            .sender
            .send(frame)
            .map_err(|_| RelayError::PartnerGone(key.clone()))?;
        Ok(partner)
    }

    /// The two connections bound by `key`, requester first.
    pub fn session(&self, key: &SessionKey) -> Option<(ConnectionId, ConnectionId)> {
        self.inner.lock().sessions.get(key).copied()
    }

    pub fn active_peers(&self) -> usize {
        self.inner.lock().peers.len()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let guard = self.inner.lock();
        let mut peers: Vec<PeerSnapshot> = guard
            .peers
            .iter()
            .map(|(_, record)| PeerSnapshot {
                connection_id: record.id.to_string(),
                sessions: record.pairings.len(),
                connected_for_ms: record.connected_at.elapsed().as_millis() as u64,
            })
            .collect();
        peers.sort_by(|a, b| b.connected_for_ms.cmp(&a.connected_for_ms));
        RegistrySnapshot {
            active_peers: guard.peers.len(),
            active_sessions: guard.sessions.len(),
            peers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(registry: &PeerRegistry) -> (ConnectionId, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (registry.register(tx), rx)
    }

    fn decode(text: &str) -> WireMessage {
        WireMessage::decode(text).expect("relay frame")
    }

    #[test]
    fn lone_peer_has_no_partner() {
        let registry = PeerRegistry::new();
        let (a, mut a_rx) = peer(&registry);
        assert!(matches!(registry.pair(a, None), Err(RelayError::NoPartner)));
        assert!(a_rx.try_recv().is_err());
        assert_eq!(registry.snapshot().active_sessions, 0);
    }

    #[test]
    fn pairing_notifies_both_sides_with_one_key() {
        let registry = PeerRegistry::new();
        let (host, mut host_rx) = peer(&registry);
        let (guest, mut guest_rx) = peer(&registry);

        let pairing = registry
            .pair(guest, Some(serde_json::json!({ "room": 7 })))
            .expect("pairing");
        assert_eq!(pairing.partner, host);
        assert_eq!(registry.session(&pairing.key), Some((guest, host)));

        match decode(&guest_rx.try_recv().expect("accepted")) {
            WireMessage::ConnectionAccepted { key } => assert_eq!(key, pairing.key),
            other => panic!("unexpected frame {other:?}"),
        }
        match decode(&host_rx.try_recv().expect("request")) {
            WireMessage::ConnectionRequest { key, payload } => {
                assert_eq!(key, Some(pairing.key.clone()));
                assert_eq!(payload, Some(serde_json::json!({ "room": 7 })));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn earliest_registered_peer_is_chosen_and_may_pair_repeatedly() {
        let registry = PeerRegistry::new();
        let (first, _first_rx) = peer(&registry);
        let (_second, _second_rx) = peer(&registry);
        let (third, _third_rx) = peer(&registry);

        let one = registry.pair(third, None).expect("first pairing");
        let two = registry.pair(third, None).expect("second pairing");
        assert_eq!(one.partner, first);
        assert_eq!(two.partner, first);
        assert_ne!(one.key, two.key);
        assert_eq!(registry.snapshot().active_sessions, 2);
    }

    #[test]
    fn frames_are_forwarded_verbatim_to_the_partner_only() {
        let registry = PeerRegistry::new();
        let (host, mut host_rx) = peer(&registry);
        let (guest, mut guest_rx) = peer(&registry);
        let (_other, mut other_rx) = peer(&registry);
        let pairing = registry.pair(guest, None).expect("pairing");
        let _ = host_rx.try_recv();
        let _ = guest_rx.try_recv();

        let frame = format!(
            "{{ \"type\": \"ICE_CANDIDATE\", \"key\": \"{}\", \"payload\": {{\"candidate\": \"c\", \"extra\": true}} }}",
            pairing.key
        );
        let to = registry
            .route(guest, &pairing.key, frame.clone())
            .expect("routed");
        assert_eq!(to, host);
        assert_eq!(host_rx.try_recv().expect("forwarded"), frame);
        assert!(other_rx.try_recv().is_err());
        assert!(guest_rx.try_recv().is_err());
    }

    #[test]
    fn unknown_keys_are_not_routed() {
        let registry = PeerRegistry::new();
        let (host, _host_rx) = peer(&registry);
        let (guest, _guest_rx) = peer(&registry);
        let (outsider, _outsider_rx) = peer(&registry);
        let pairing = registry.pair(guest, None).expect("pairing");

        let stale = SessionKey::from("stale");
        assert!(matches!(
            registry.route(guest, &stale, "{}".into()),
            Err(RelayError::UnknownSession(_))
        ));
        // a third peer cannot inject into someone else's session
        assert!(matches!(
            registry.route(outsider, &pairing.key, "{}".into()),
            Err(RelayError::UnknownSession(_))
        ));
        assert!(registry.route(host, &pairing.key, "{}".into()).is_ok());
    }

    #[test]
    fn unregister_purges_sessions_on_both_sides() {
        let registry = PeerRegistry::new();
        let (host, _host_rx) = peer(&registry);
        let (guest, _guest_rx) = peer(&registry);
        let pairing = registry.pair(guest, None).expect("pairing");

        let removal = registry.unregister(host).expect("registered");
        assert_eq!(removal.purged_sessions, 1);
        assert_eq!(removal.active_peers, 1);
        assert_eq!(registry.session(&pairing.key), None);
        assert!(matches!(
            registry.route(guest, &pairing.key, "{}".into()),
            Err(RelayError::UnknownSession(_))
        ));
        assert_eq!(registry.snapshot().peers[0].sessions, 0);
        assert_eq!(registry.unregister(host), None);
    }

    #[test]
    fn reused_slot_does_not_inherit_a_closed_peer() {
        let registry = PeerRegistry::new();
        let (host, _host_rx) = peer(&registry);
        let (guest, _guest_rx) = peer(&registry);
        let pairing = registry.pair(guest, None).expect("pairing");
        registry.unregister(guest).expect("registered");

        let (replacement, _replacement_rx) = peer(&registry);
        assert_ne!(replacement, guest);
        assert!(matches!(
            registry.route(guest, &pairing.key, "{}".into()),
            Err(RelayError::UnknownPeer(_))
        ));
        assert!(matches!(
            registry.pair(guest, None),
            Err(RelayError::UnknownPeer(_))
        ));
        assert_eq!(registry.pair(replacement, None).expect("pairing").partner, host);
    }
}
