use std::{future::Future, sync::Arc, time::Duration};

use futures::future::{BoxFuture, OptionFuture};
use tokio::{
    sync::broadcast::error::RecvError,
    time::{sleep_until, Instant},
};
use tracing::{debug, info, warn};

use dcnow_wire::SessionDescription;

use crate::codec::{Classified, SignalCodec};
use crate::connectivity::{ChannelOptions, Connectivity, ConnectivityEvent, Connector};
use crate::error::{ConnectivityError, NegotiationError};
use crate::machine::{Effect, Input, Negotiation, Role};
use crate::scope::ListenerScope;
use crate::transport::{Transport, TransportEvent};

/// Everything one negotiation attempt needs besides the transport.
#[derive(Debug, Clone)]
pub struct NegotiationConfig<F, S> {
    pub connector: F,
    pub channel: ChannelOptions,
    pub signals: S,
    /// Overall deadline; expiry resolves with [`NegotiationError::Timeout`].
    pub deadline: Option<Duration>,
}

/// An open data channel and the connection that owns it.
pub struct Established<P: Connectivity> {
    pub connection: P,
    pub channel: P::Channel,
}

type Resolution<C> = Result<C, NegotiationError>;

/// Runs the offerer side: creates the outbound channel and sends the offer.
pub fn offer_connection<T, F, S>(
    transport: Arc<T>,
    config: NegotiationConfig<F, S>,
) -> impl Future<Output = Result<Established<F::Peer>, NegotiationError>> + Send + 'static
where
    T: Transport + ?Sized,
    F: Connector,
    S: SignalCodec,
{
    negotiate(Role::Offerer, transport, config)
}

/// Runs the answerer side: waits for an offer and answers it.
pub fn answer_connection<T, F, S>(
    transport: Arc<T>,
    config: NegotiationConfig<F, S>,
) -> impl Future<Output = Result<Established<F::Peer>, NegotiationError>> + Send + 'static
where
    T: Transport + ?Sized,
    F: Connector,
    S: SignalCodec,
{
    negotiate(Role::Answerer, transport, config)
}

/// Subscribes to `transport` immediately, so frames published after this call
/// returns reach the negotiation even if the future is polled later.
pub fn negotiate<T, F, S>(
    role: Role,
    transport: Arc<T>,
    config: NegotiationConfig<F, S>,
) -> impl Future<Output = Result<Established<F::Peer>, NegotiationError>> + Send + 'static
where
    T: Transport + ?Sized,
    F: Connector,
    S: SignalCodec,
{
    let scope = ListenerScope::acquire(transport.subscribe(), session_label(&config.signals));
    run(role, transport, config, scope)
}

async fn run<T, F, S>(
    role: Role,
    transport: Arc<T>,
    config: NegotiationConfig<F, S>,
    mut scope: ListenerScope<<F::Peer as Connectivity>::Channel>,
) -> Result<Established<F::Peer>, NegotiationError>
where
    T: Transport + ?Sized,
    F: Connector,
    S: SignalCodec,
{
    let key = session_label(&config.signals);
    let deadline = config.deadline.map(|limit| Instant::now() + limit);
    let deadline_elapsed = async move {
        match deadline {
            Some(at) => sleep_until(at).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline_elapsed);

    if transport.is_closed() {
        scope.release(NegotiationError::TransportClosed.label());
        return Err(NegotiationError::TransportClosed);
    }

    let connected = tokio::select! {
        connected = config.connector.connect() => {
            connected.map_err(|err| NegotiationError::Connectivity(err.to_string()))
        }
        _ = &mut deadline_elapsed => Err(NegotiationError::Timeout),
    };
    let connection = match connected {
        Ok(connection) => connection,
        Err(error) => {
            scope.release(error.label());
            warn!(target = "negotiation", key = %key, role = %role, error = %error, "connection setup failed");
            return Err(error);
        }
    };
    scope.attach(&connection);
    debug!(target = "negotiation", key = %key, role = %role, "negotiation started");

    let mut driver = Driver {
        transport: &*transport,
        connection: &connection,
        signals: &config.signals,
        machine: Negotiation::new(role),
        pending_local: None,
    };

    let mut resolution = None;
    let mut _outbound = None;
    if role == Role::Offerer {
        let created = tokio::select! {
            created = connection.create_channel(&config.channel) => {
                created.map_err(|err| Input::PrimitiveFailed(err.to_string()))
            }
            _ = &mut deadline_elapsed => Err(Input::DeadlineElapsed),
        };
        match created {
            Ok(channel) => _outbound = Some(channel),
            Err(failure) => resolution = driver.apply(failure).await,
        }
    }

    let resolution = match resolution {
        Some(resolution) => resolution,
        None => loop {
            let input = tokio::select! {
                event = scope.transport.recv() => match event {
                    Ok(TransportEvent::Message(frame)) => match config.signals.classify(&frame) {
                        Classified::Description(description) => Input::RemoteDescription(description),
                        Classified::Candidate(candidate) => Input::RemoteCandidate(candidate),
                        Classified::Rejected(reason) => Input::RemoteRejected(reason),
                        Classified::Ignored => continue,
                    },
                    Ok(TransportEvent::Closed) | Err(RecvError::Closed) => Input::TransportClosed,
                    Err(RecvError::Lagged(skipped)) => {
                        // dropped frames may include the description itself
                        warn!(target = "negotiation", key = %key, skipped, "signaling subscriber lagged");
                        Input::TransportClosed
                    }
                },
                event = next_event(&mut scope.connectivity) => match event {
                    Some(event) => input_from(event),
                    None => Input::PrimitiveFailed("connection event stream ended".to_string()),
                },
                Some(generated) = OptionFuture::from(driver.pending_local.as_mut()), if driver.pending_local.is_some() => {
                    driver.pending_local = None;
                    match generated {
                        Ok(description) => Input::LocalDescription(description),
                        Err(err) => Input::PrimitiveFailed(err.to_string()),
                    }
                }
                _ = &mut deadline_elapsed => Input::DeadlineElapsed,
            };

            if let Some(resolution) = driver.apply(input).await {
                break resolution;
            }
        },
    };
    drop(driver);

    match resolution {
        Ok(channel) => {
            scope.release("established");
            info!(target = "negotiation", key = %key, role = %role, "data channel established");
            Ok(Established {
                connection,
                channel,
            })
        }
        Err(error) => {
            scope.release(error.label());
            warn!(target = "negotiation", key = %key, role = %role, error = %error, "negotiation failed");
            connection.close().await;
            Err(error)
        }
    }
}

struct Driver<'a, T: ?Sized, P: Connectivity, S> {
    transport: &'a T,
    connection: &'a P,
    signals: &'a S,
    machine: Negotiation,
    pending_local: Option<BoxFuture<'a, Result<SessionDescription, ConnectivityError>>>,
}

impl<'a, T, P, S> Driver<'a, T, P, S>
where
    T: Transport + ?Sized,
    P: Connectivity,
    S: SignalCodec,
{
    /// Steps the machine and performs its effects in order. A failing effect
    /// abandons the rest of its batch and is fed back as a new input.
    async fn apply(&mut self, input: Input<P::Channel>) -> Option<Resolution<P::Channel>> {
        let mut next = Some(input);
        while let Some(input) = next.take() {
            for effect in self.machine.step(input) {
                match self.execute(effect).await {
                    Ok(Some(resolution)) => return Some(resolution),
                    Ok(None) => {}
                    Err(failure) => {
                        next = Some(failure);
                        break;
                    }
                }
            }
        }
        None
    }

    async fn execute(
        &mut self,
        effect: Effect<P::Channel>,
    ) -> Result<Option<Resolution<P::Channel>>, Input<P::Channel>> {
        let connection: &'a P = self.connection;
        match effect {
            Effect::CreateOffer => self.pending_local = Some(connection.create_offer()),
            Effect::CreateAnswer => self.pending_local = Some(connection.create_answer()),
            Effect::SetLocalDescription(description) => connection
                .set_local_description(description)
                .await
                .map_err(primitive_failed)?,
            Effect::SetRemoteDescription(description) => connection
                .set_remote_description(description)
                .await
                .map_err(primitive_failed)?,
            Effect::AddRemoteCandidate(candidate) => connection
                .add_remote_candidate(candidate)
                .await
                .map_err(primitive_failed)?,
            Effect::SendDescription(description) => {
                let frame = self
                    .signals
                    .encode_description(&description)
                    .map_err(primitive_failed)?;
                self.send(frame)?;
            }
            Effect::SendCandidate(candidate) => {
                let frame = self
                    .signals
                    .encode_candidate(&candidate)
                    .map_err(primitive_failed)?;
                self.send(frame)?;
            }
            Effect::Succeed(channel) => return Ok(Some(Ok(channel))),
            Effect::Fail(error) => return Ok(Some(Err(error))),
        }
        Ok(None)
    }

    fn send(&self, frame: String) -> Result<(), Input<P::Channel>> {
        self.transport.send(frame).map_err(|err| {
            debug!(target = "negotiation", error = %err, "signaling send failed");
            Input::TransportClosed
        })
    }
}

fn session_label<S: SignalCodec>(signals: &S) -> String {
    signals
        .session_key()
        .map(|key| key.to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn primitive_failed<C>(err: impl std::fmt::Display) -> Input<C> {
    Input::PrimitiveFailed(err.to_string())
}

fn input_from<C>(event: ConnectivityEvent<C>) -> Input<C> {
    match event {
        ConnectivityEvent::NegotiationNeeded => Input::NegotiationNeeded,
        ConnectivityEvent::LocalCandidate(candidate) => Input::LocalCandidate(candidate),
        ConnectivityEvent::StateChanged(state) => Input::StateChanged(state),
        ConnectivityEvent::InboundChannel(channel) => Input::InboundChannel(channel),
        ConnectivityEvent::ChannelOpen(channel) => Input::ChannelOpen(channel),
    }
}

async fn next_event<C>(
    events: &mut Option<tokio::sync::mpsc::UnboundedReceiver<ConnectivityEvent<C>>>,
) -> Option<ConnectivityEvent<C>> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}
