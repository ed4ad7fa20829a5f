//! Relay-assisted negotiation of direct peer-to-peer data channels.
//!
//! A negotiation drives one [`Connectivity`] through the offer/answer
//! exchange using frames read from and written to a signaling [`Transport`].
//! Description and candidate frames may arrive in any order; candidates that
//! arrive before they can be applied are held back and flushed in arrival
//! order once the matching description is in place.
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use dcnow_engine::{rtc::RtcConnector, ws::WsTransport, Orchestrator, OrchestratorSettings};
//!
//! let transport = WsTransport::connect("ws://127.0.0.1:8080").await?;
//! let (orchestrator, mut outcomes) =
//!     Orchestrator::start(transport, RtcConnector::default(), OrchestratorSettings::default());
//! orchestrator.request_connection(None)?;
//! while let Some(outcome) = outcomes.recv().await {
//!     println!("{} finished: {}", outcome.key, outcome.result.is_ok());
//! }
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod connectivity;
pub mod error;
pub mod machine;
pub mod negotiate;
pub mod orchestrator;
pub mod rtc;
mod scope;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;
pub mod ws;

pub use codec::{Classified, KeyedCodec, SignalCodec};
pub use connectivity::{
    ChannelOptions, Connectivity, ConnectivityEvent, ConnectivityState, Connector, DataChannel,
};
pub use dcnow_wire::{IceCandidate, SessionDescription, SessionKey};
pub use error::{ConnectivityError, NegotiationError, TransportError};
pub use machine::{Negotiation, NegotiationState, Role};
pub use negotiate::{answer_connection, negotiate, offer_connection, Established, NegotiationConfig};
pub use orchestrator::{Orchestrator, OrchestratorSettings, SessionOutcome};
pub use transport::{Subscription, Transport, TransportEvent};
