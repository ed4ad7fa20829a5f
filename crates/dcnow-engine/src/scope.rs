use tokio::sync::mpsc;
use tracing::debug;

use crate::connectivity::{Connectivity, ConnectivityEvent};
use crate::transport::Subscription;

type Closer = Box<dyn FnOnce() + Send>;

/// Listeners held by one negotiation attempt.
///
/// Taking the scope with [`ListenerScope::release`] detaches every listener;
/// since it consumes the scope it can only run once. Dropping an unreleased
/// scope detaches them as well and closes the attached connection, which
/// covers futures abandoned mid-flight.
pub(crate) struct ListenerScope<C> {
    label: String,
    pub(crate) transport: Subscription,
    pub(crate) connectivity: Option<mpsc::UnboundedReceiver<ConnectivityEvent<C>>>,
    on_abandon: Option<Closer>,
    armed: bool,
}

impl<C> ListenerScope<C> {
    pub(crate) fn acquire(transport: Subscription, label: String) -> Self {
        Self {
            label,
            transport,
            connectivity: None,
            on_abandon: None,
            armed: true,
        }
    }

    /// Starts listening to `connection`. If the scope is abandoned, the
    /// connection is closed on the current runtime.
    pub(crate) fn attach<P>(&mut self, connection: &P)
    where
        P: Connectivity<Channel = C>,
    {
        self.connectivity = Some(connection.subscribe());
        let connection = connection.clone();
        self.on_abandon = Some(Box::new(move || {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move { connection.close().await });
            }
        }));
    }

    pub(crate) fn release(mut self, outcome: &'static str) {
        self.armed = false;
        self.on_abandon = None;
        debug!(
            target = "negotiation",
            key = %self.label,
            outcome,
            "listeners released"
        );
    }
}

impl<C> Drop for ListenerScope<C> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        debug!(
            target = "negotiation",
            key = %self.label,
            "negotiation abandoned; listeners released"
        );
        if let Some(close) = self.on_abandon.take() {
            close();
        }
    }
}
