use std::{net::SocketAddr, sync::Arc, time::Duration};

use dcnow_engine::{
    testing::{SimConnector, SimOptions},
    ws::WsTransport,
    DataChannel, NegotiationError, Orchestrator, OrchestratorSettings, Role,
};
use dcnow_relay::{serve, AppState, DelayRange};
use dcnow_wire::{SessionDescription, SessionKey, WireMessage};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::oneshot,
    time::{sleep, timeout},
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(200);

struct Relay {
    addr: SocketAddr,
    state: Arc<AppState>,
    _shutdown: oneshot::Sender<()>,
}

impl Relay {
    async fn start(delay: DelayRange) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let state = AppState::new(delay, None);
        let (shutdown, stop) = oneshot::channel::<()>();
        tokio::spawn(serve(listener, Arc::clone(&state), async {
            let _ = stop.await;
        }));
        Self {
            addr,
            state,
            _shutdown: shutdown,
        }
    }

    fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    async fn client(&self) -> Client {
        let before = self.state.registry().active_peers();
        let (client, _) = connect_async(self.url()).await.expect("connect");
        self.wait_for_peers(before + 1).await;
        client
    }

    async fn wait_for_peers(&self, count: usize) {
        timeout(WAIT, async {
            while self.state.registry().active_peers() != count {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("peer count reached");
    }

    async fn get(&self, path: &str) -> String {
        let mut stream = TcpStream::connect(self.addr).await.expect("connect");
        let request = format!("GET {path} HTTP/1.1\r\nHost: relay\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.expect("write");
        let mut response = String::new();
        stream.read_to_string(&mut response).await.expect("read");
        response
    }
}

async fn send(client: &mut Client, text: impl Into<String>) {
    client.send(Message::Text(text.into())).await.expect("send");
}

async fn recv(client: &mut Client) -> String {
    loop {
        let message = timeout(WAIT, client.next())
            .await
            .expect("frame before timeout")
            .expect("stream open")
            .expect("frame");
        if let Message::Text(text) = message {
            return text;
        }
    }
}

async fn assert_silent(client: &mut Client) {
    if let Ok(Some(Ok(Message::Text(text)))) = timeout(QUIET, client.next()).await {
        panic!("unexpected frame {text}");
    }
}

async fn paired(relay: &Relay) -> (Client, Client, SessionKey) {
    let mut host = relay.client().await;
    let mut guest = relay.client().await;
    send(&mut guest, r#"{"type":"CONNECTION_REQUEST"}"#).await;
    let key = match WireMessage::decode(&recv(&mut guest).await).expect("decode") {
        WireMessage::ConnectionAccepted { key } => key,
        other => panic!("expected acceptance, got {other:?}"),
    };
    let _request = recv(&mut host).await;
    (host, guest, key)
}

#[tokio::test]
async fn lone_request_is_dropped() {
    let relay = Relay::start(DelayRange::none()).await;
    let mut alone = relay.client().await;
    send(&mut alone, r#"{"type":"CONNECTION_REQUEST"}"#).await;
    assert_silent(&mut alone).await;
    assert_eq!(relay.state.registry().snapshot().active_sessions, 0);
}

#[tokio::test]
async fn request_pairs_with_the_earliest_peer_and_carries_payload() {
    let relay = Relay::start(DelayRange::none()).await;
    let mut host = relay.client().await;
    let mut guest = relay.client().await;

    send(
        &mut guest,
        json!({ "type": "CONNECTION_REQUEST", "payload": { "name": "guest" } }).to_string(),
    )
    .await;

    let accepted: Value = serde_json::from_str(&recv(&mut guest).await).expect("json");
    assert_eq!(accepted["type"], "CONNECTION_ACCEPTED");
    let key = accepted["key"].as_str().expect("key").to_string();

    let request: Value = serde_json::from_str(&recv(&mut host).await).expect("json");
    assert_eq!(
        request,
        json!({ "type": "CONNECTION_REQUEST", "key": key, "payload": { "name": "guest" } })
    );
}

#[tokio::test]
async fn keyed_frames_are_forwarded_verbatim() {
    let relay = Relay::start(DelayRange::none()).await;
    let (mut host, mut guest, key) = paired(&relay).await;

    let offer = format!(
        "{{\"type\":\"SDP_OFFER\",  \"key\":\"{key}\",\"payload\":{{\"type\":\"offer\",\"sdp\":\"v=0\\r\\n\"}},\"note\":1}}"
    );
    send(&mut host, offer.clone()).await;
    assert_eq!(recv(&mut guest).await, offer);

    let rejection = format!("{{\"type\":\"CONNECTION_REJECTED\",\"key\":\"{key}\"}}");
    send(&mut guest, rejection.clone()).await;
    assert_eq!(recv(&mut host).await, rejection);
}

#[tokio::test]
async fn stale_keys_and_unknown_frames_are_dropped() {
    let relay = Relay::start(DelayRange::none()).await;
    let (mut host, mut guest, _key) = paired(&relay).await;

    send(
        &mut host,
        r#"{"type":"ICE_CANDIDATE","key":"stale","payload":{"candidate":"c"}}"#,
    )
    .await;
    send(&mut host, r#"{"type":"ICE_CANDIDATE","payload":{"candidate":"c"}}"#).await;
    send(&mut host, r#"{"type":"SOMETHING_ELSE","key":"x"}"#).await;
    send(&mut host, "not json").await;

    assert_silent(&mut guest).await;
    assert_silent(&mut host).await;
}

#[tokio::test]
async fn closing_a_peer_purges_its_sessions() {
    let relay = Relay::start(DelayRange::none()).await;
    let (host, mut guest, key) = paired(&relay).await;
    assert_eq!(relay.state.registry().snapshot().active_sessions, 1);

    drop(host);
    relay.wait_for_peers(1).await;
    assert_eq!(relay.state.registry().snapshot().active_sessions, 0);

    // a newcomer may take the freed slot but never the old session
    let mut newcomer = relay.client().await;
    send(
        &mut guest,
        format!("{{\"type\":\"ICE_CANDIDATE\",\"key\":\"{key}\",\"payload\":{{\"candidate\":\"c\"}}}}"),
    )
    .await;
    assert_silent(&mut newcomer).await;
}

#[tokio::test]
async fn http_surface_reports_health_and_stats() {
    let relay = Relay::start(DelayRange::none()).await;
    let (_host, _guest, _key) = paired(&relay).await;

    let health = relay.get("/healthz").await;
    assert!(health.starts_with("HTTP/1.1 200"));
    assert!(health.contains(r#"{"status":"ok"}"#));

    let stats = relay.get("/stats").await;
    assert!(stats.contains(r#""active_peers":2"#));
    assert!(stats.contains(r#""active_sessions":1"#));

    assert!(relay.get("/metrics").await.starts_with("HTTP/1.1 200"));
}

async fn negotiate_through(relay: &Relay) {
    let settings = OrchestratorSettings {
        deadline: WAIT,
        ..OrchestratorSettings::default()
    };
    let options = SimOptions {
        candidates: 3,
        ..SimOptions::default()
    };

    let host_transport = WsTransport::connect(&relay.url()).await.expect("host");
    relay.wait_for_peers(1).await;
    let guest_transport = WsTransport::connect(&relay.url()).await.expect("guest");
    relay.wait_for_peers(2).await;

    let host_connector = SimConnector::new(options.clone());
    let guest_connector = SimConnector::new(options);
    let (_host, mut host_outcomes) =
        Orchestrator::start(host_transport, host_connector.clone(), settings.clone());
    let (guest, mut guest_outcomes) =
        Orchestrator::start(guest_transport, guest_connector.clone(), settings);

    guest.request_connection(Some(json!({ "hello": "there" }))).expect("request");

    let host_outcome = timeout(WAIT, host_outcomes.recv())
        .await
        .expect("host outcome")
        .expect("host channel");
    let guest_outcome = timeout(WAIT, guest_outcomes.recv())
        .await
        .expect("guest outcome")
        .expect("guest channel");

    assert_eq!(host_outcome.key, guest_outcome.key);
    assert_eq!(host_outcome.role, Role::Offerer);
    assert_eq!(guest_outcome.role, Role::Answerer);
    let host_established = host_outcome.result.expect("host established");
    let guest_established = guest_outcome.result.expect("guest established");
    assert_eq!(
        host_established.channel.label(),
        guest_established.channel.label()
    );

    // the connection comes up on the first usable candidate; the rest may
    // arrive after resolution
    for peer in host_connector.peers().into_iter().chain(guest_connector.peers()) {
        assert!(peer.rejected_candidates().is_empty());
        assert!(!peer.applied_candidates().is_empty());
    }
}

#[tokio::test]
async fn orchestrated_peers_connect_through_the_relay() {
    let relay = Relay::start(DelayRange::none()).await;
    negotiate_through(&relay).await;
}

#[tokio::test]
async fn orchestrated_peers_connect_despite_random_delays() {
    let delay = DelayRange::new(Duration::from_millis(0), Duration::from_millis(40))
        .expect("delay range");
    let relay = Relay::start(delay).await;
    negotiate_through(&relay).await;
}

#[tokio::test]
async fn rejected_request_fails_the_requester() {
    let relay = Relay::start(DelayRange::none()).await;
    let host_transport = WsTransport::connect(&relay.url()).await.expect("host");
    relay.wait_for_peers(1).await;
    let guest_transport = WsTransport::connect(&relay.url()).await.expect("guest");
    relay.wait_for_peers(2).await;

    let (_host, mut host_outcomes) = Orchestrator::start(
        host_transport,
        SimConnector::default(),
        OrchestratorSettings {
            accept_incoming: false,
            ..OrchestratorSettings::default()
        },
    );
    let (guest, mut guest_outcomes) = Orchestrator::start(
        guest_transport,
        SimConnector::default(),
        OrchestratorSettings::default(),
    );
    guest.request_connection(None).expect("request");

    let outcome = timeout(WAIT, guest_outcomes.recv())
        .await
        .expect("guest outcome")
        .expect("guest channel");
    assert_eq!(outcome.role, Role::Answerer);
    assert!(matches!(
        outcome.result,
        Err(NegotiationError::RemoteRejected(_))
    ));
    assert!(timeout(QUIET, host_outcomes.recv()).await.is_err());
}

#[tokio::test]
async fn host_vanishing_mid_handshake_times_the_requester_out() {
    let relay = Relay::start(DelayRange::none()).await;
    let mut host = relay.client().await;
    let guest_transport = WsTransport::connect(&relay.url()).await.expect("guest");
    relay.wait_for_peers(2).await;

    let (guest, mut guest_outcomes) = Orchestrator::start(
        guest_transport,
        SimConnector::default(),
        OrchestratorSettings {
            deadline: Duration::from_millis(500),
            ..OrchestratorSettings::default()
        },
    );
    guest.request_connection(None).expect("request");

    let key = match WireMessage::decode(&recv(&mut host).await).expect("decode") {
        WireMessage::ConnectionRequest { key: Some(key), .. } => key,
        other => panic!("expected a keyed request, got {other:?}"),
    };
    let offer = WireMessage::description(
        key.clone(),
        SessionDescription::offer("v=0\r\na=sim-channel:chat\r\n"),
    )
    .encode()
    .expect("encode");
    send(&mut host, offer).await;
    drop(host);
    relay.wait_for_peers(1).await;

    let outcome = timeout(WAIT, guest_outcomes.recv())
        .await
        .expect("guest outcome")
        .expect("guest channel");
    assert_eq!(outcome.key, key);
    assert_eq!(outcome.role, Role::Answerer);
    assert!(matches!(outcome.result, Err(NegotiationError::Timeout)));
    assert_eq!(relay.state.registry().snapshot().active_sessions, 0);
}
