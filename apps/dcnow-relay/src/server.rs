use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tokio::{net::TcpListener, sync::mpsc};
use tracing::{debug, info, trace, warn};

use dcnow_wire::{FrameKind, RoutingHeader};

use crate::config::DelayRange;
use crate::registry::{ConnectionId, PeerRegistry};

const METRIC_CONNECTIONS_ACTIVE: &str = "dcnow_relay_connections_active";
const METRIC_PAIRINGS_TOTAL: &str = "dcnow_relay_pairings_total";
const METRIC_PAIRINGS_UNMATCHED: &str = "dcnow_relay_pairings_unmatched_total";
const METRIC_FORWARDED_TOTAL: &str = "dcnow_relay_messages_forwarded_total";
const METRIC_DROPPED_TOTAL: &str = "dcnow_relay_messages_dropped_total";

pub struct AppState {
    registry: PeerRegistry,
    delay: DelayRange,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(delay: DelayRange, metrics: Option<PrometheusHandle>) -> Arc<Self> {
        Arc::new(Self {
            registry: PeerRegistry::new(),
            delay,
            metrics,
        })
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    fn render_metrics(&self) -> String {
        self.metrics
            .as_ref()
            .map(PrometheusHandle::render)
            .unwrap_or_default()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/healthz", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Serves the relay on `listener` until `shutdown` resolves.
pub async fn serve<S>(listener: TcpListener, state: Arc<AppState>, shutdown: S) -> Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("server shutdown with error")
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.registry.snapshot())
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state.render_metrics();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state, remote))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>, remote: SocketAddr) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let peer = state.registry.register(tx);
    gauge!(METRIC_CONNECTIONS_ACTIVE, state.registry.active_peers() as f64);
    info!(peer = %peer, remote = %remote, "peer connected");

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        debug!(peer = %peer, "writer task finished");
    });

    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Close(frame)) => {
                info!(
                    peer = %peer,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "peer closed websocket"
                );
                break;
            }
            Ok(Message::Text(text)) => dispatch(&state, peer, text),
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => dispatch(&state, peer, text),
                Err(_) => {
                    debug!(peer = %peer, "dropping non-utf8 binary frame");
                    counter!(METRIC_DROPPED_TOTAL, 1, "reason" => "malformed");
                }
            },
            Ok(_) => continue,
            Err(err) => {
                warn!(peer = %peer, error = %err, "error receiving message");
                break;
            }
        }
    }

    if let Some(removal) = state.registry.unregister(peer) {
        gauge!(METRIC_CONNECTIONS_ACTIVE, removal.active_peers as f64);
        info!(
            peer = %peer,
            purged_sessions = removal.purged_sessions,
            "peer disconnected"
        );
    }
    writer.abort();
}

fn dispatch(state: &Arc<AppState>, from: ConnectionId, text: String) {
    if state.delay.is_inline() {
        route_frame(state, from, &text);
        return;
    }
    let delay = state.delay.sample();
    let state = Arc::clone(state);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        route_frame(&state, from, &text);
    });
}

fn route_frame(state: &AppState, from: ConnectionId, text: &str) {
    let header = match RoutingHeader::parse(text) {
        Ok(header) => header,
        Err(err) => {
            warn!(target = "relay", peer = %from, error = %err, "dropping malformed frame");
            counter!(METRIC_DROPPED_TOTAL, 1, "reason" => "malformed");
            return;
        }
    };

    match header.kind() {
        FrameKind::ConnectionRequest => match state.registry.pair(from, header.payload) {
            Ok(pairing) => {
                counter!(METRIC_PAIRINGS_TOTAL, 1);
                info!(
                    key = %pairing.key,
                    requester = %pairing.requester,
                    partner = %pairing.partner,
                    "peers paired"
                );
            }
            Err(err) => {
                counter!(METRIC_PAIRINGS_UNMATCHED, 1, "reason" => err.metric_label());
                debug!(target = "relay", peer = %from, error = %err, "connection request dropped");
            }
        },
        FrameKind::Keyed => {
            let Some(key) = header.key else {
                counter!(METRIC_DROPPED_TOTAL, 1, "reason" => "missing_key");
                debug!(
                    target = "relay",
                    peer = %from,
                    kind = %header.tag,
                    "dropping frame without a session key"
                );
                return;
            };
            match state.registry.route(from, &key, text.to_owned()) {
                Ok(to) => {
                    counter!(METRIC_FORWARDED_TOTAL, 1, "type" => header.tag.clone());
                    trace!(
                        target = "relay",
                        key = %key,
                        from = %from,
                        to = %to,
                        kind = %header.tag,
                        "frame forwarded"
                    );
                }
                Err(err) => {
                    counter!(METRIC_DROPPED_TOTAL, 1, "reason" => err.metric_label());
                    debug!(
                        target = "relay",
                        key = %key,
                        peer = %from,
                        kind = %header.tag,
                        error = %err,
                        "frame dropped"
                    );
                }
            }
        }
        FrameKind::Other => {
            counter!(METRIC_DROPPED_TOTAL, 1, "reason" => "unknown_type");
            debug!(
                target = "relay",
                peer = %from,
                kind = %header.tag,
                "dropping frame of unknown type"
            );
        }
    }
}
