//! Pure negotiation state machine.
//!
//! [`Negotiation::step`] consumes one input and returns the effects the driver
//! must perform, in order. It never touches the network or the connection, so
//! buffering order and the single-resolution rule can be checked directly.

use std::fmt;

use dcnow_wire::{DescriptionKind, IceCandidate, SessionDescription};

use crate::connectivity::ConnectivityState;
use crate::error::NegotiationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offerer,
    Answerer,
}

impl Role {
    /// Kind of description this role expects from the remote side.
    pub fn remote_kind(self) -> DescriptionKind {
        match self {
            Role::Offerer => DescriptionKind::Answer,
            Role::Answerer => DescriptionKind::Offer,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Offerer => f.write_str("offerer"),
            Role::Answerer => f.write_str("answerer"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationState {
    AwaitingRemoteDescription,
    /// Answerer only: remote offer applied, answer not produced yet.
    AwaitingLocalDescription,
    /// Descriptions exchanged; waiting for the data channel to open.
    AwaitingChannelOpen,
    Established,
    Failed(NegotiationError),
}

#[derive(Debug)]
pub enum Input<C> {
    NegotiationNeeded,
    LocalDescription(SessionDescription),
    LocalCandidate(Option<IceCandidate>),
    RemoteDescription(SessionDescription),
    RemoteCandidate(IceCandidate),
    RemoteRejected(String),
    StateChanged(ConnectivityState),
    InboundChannel(C),
    ChannelOpen(C),
    TransportClosed,
    DeadlineElapsed,
    PrimitiveFailed(String),
}

#[derive(Debug)]
pub enum Effect<C> {
    CreateOffer,
    CreateAnswer,
    SetLocalDescription(SessionDescription),
    SetRemoteDescription(SessionDescription),
    AddRemoteCandidate(IceCandidate),
    SendDescription(SessionDescription),
    SendCandidate(IceCandidate),
    Succeed(C),
    Fail(NegotiationError),
}

#[derive(Debug)]
pub struct Negotiation {
    role: Role,
    state: NegotiationState,
    buffered: Vec<IceCandidate>,
    candidates_ready: bool,
    local_requested: bool,
    inbound_seen: bool,
}

impl Negotiation {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: NegotiationState::AwaitingRemoteDescription,
            buffered: Vec::new(),
            candidates_ready: false,
            local_requested: false,
            inbound_seen: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> &NegotiationState {
        &self.state
    }

    pub fn is_resolved(&self) -> bool {
        matches!(
            self.state,
            NegotiationState::Established | NegotiationState::Failed(_)
        )
    }

    /// Remote candidates held back until they may be applied.
    pub fn buffered(&self) -> &[IceCandidate] {
        &self.buffered
    }

    pub fn step<C>(&mut self, input: Input<C>) -> Vec<Effect<C>> {
        if self.is_resolved() {
            return Vec::new();
        }

        match input {
            Input::NegotiationNeeded => {
                if self.role != Role::Offerer || self.local_requested {
                    return Vec::new();
                }
                self.local_requested = true;
                vec![Effect::CreateOffer]
            }
            Input::LocalDescription(description) => self.on_local_description(description),
            Input::LocalCandidate(Some(candidate)) => vec![Effect::SendCandidate(candidate)],
            Input::LocalCandidate(None) => Vec::new(),
            Input::RemoteDescription(description) => self.on_remote_description(description),
            Input::RemoteCandidate(candidate) => {
                if self.candidates_ready {
                    vec![Effect::AddRemoteCandidate(candidate)]
                } else {
                    self.buffered.push(candidate);
                    Vec::new()
                }
            }
            Input::RemoteRejected(reason) => self.fail(NegotiationError::RemoteRejected(reason)),
            Input::StateChanged(state) if state.is_terminal() => {
                self.fail(NegotiationError::ConnectivityLost(state))
            }
            Input::StateChanged(_) => Vec::new(),
            Input::InboundChannel(_) => {
                if self.role == Role::Answerer {
                    self.inbound_seen = true;
                }
                Vec::new()
            }
            Input::ChannelOpen(channel) => match self.role {
                Role::Offerer => self.succeed(channel),
                Role::Answerer if self.inbound_seen => self.succeed(channel),
                Role::Answerer => Vec::new(),
            },
            Input::TransportClosed => self.fail(NegotiationError::TransportClosed),
            Input::DeadlineElapsed => self.fail(NegotiationError::Timeout),
            Input::PrimitiveFailed(reason) => self.fail(NegotiationError::Connectivity(reason)),
        }
    }

    fn on_local_description<C>(&mut self, description: SessionDescription) -> Vec<Effect<C>> {
        match self.role {
            Role::Offerer => vec![
                Effect::SetLocalDescription(description.clone()),
                Effect::SendDescription(description),
            ],
            Role::Answerer => {
                if self.state != NegotiationState::AwaitingLocalDescription {
                    return Vec::new();
                }
                self.state = NegotiationState::AwaitingChannelOpen;
                let mut effects = vec![Effect::SetLocalDescription(description.clone())];
                effects.extend(self.flush());
                effects.push(Effect::SendDescription(description));
                effects
            }
        }
    }

    fn on_remote_description<C>(&mut self, description: SessionDescription) -> Vec<Effect<C>> {
        if description.kind != self.role.remote_kind()
            || self.state != NegotiationState::AwaitingRemoteDescription
        {
            return Vec::new();
        }

        match self.role {
            Role::Offerer => {
                self.state = NegotiationState::AwaitingChannelOpen;
                let mut effects = vec![Effect::SetRemoteDescription(description)];
                effects.extend(self.flush());
                effects
            }
            Role::Answerer => {
                self.state = NegotiationState::AwaitingLocalDescription;
                self.local_requested = true;
                vec![Effect::SetRemoteDescription(description), Effect::CreateAnswer]
            }
        }
    }

    fn flush<C>(&mut self) -> Vec<Effect<C>> {
        self.candidates_ready = true;
        self.buffered
            .drain(..)
            .map(Effect::AddRemoteCandidate)
            .collect()
    }

    fn succeed<C>(&mut self, channel: C) -> Vec<Effect<C>> {
        self.state = NegotiationState::Established;
        self.buffered.clear();
        vec![Effect::Succeed(channel)]
    }

    fn fail<C>(&mut self, error: NegotiationError) -> Vec<Effect<C>> {
        self.state = NegotiationState::Failed(error.clone());
        self.buffered.clear();
        vec![Effect::Fail(error)]
    }
}
