//! WebSocket Relay Server
//!
//! An axum router on one port: `GET /` with a WebSocket upgrade becomes a
//! signaling session paired through the lobby registry; the same path without
//! an upgrade gets a liveness response. Everything else is `404`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, instrument, warn};

use crate::network::protocol::{AckReply, ClientEnvelope, ClientEvent, ServerEvent};
use crate::network::registry::{ConnectionId, Departure, LobbyRegistry, Membership, Participant};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Per-connection outbound queue size.
    pub channel_capacity: usize,
    /// Server version string.
    pub version: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], crate::DEFAULT_RELAY_PORT)),
            max_connections: 1000,
            channel_capacity: 64,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl RelayConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: std::env::var("AIMLINK_BIND")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.bind_addr),
            max_connections: std::env::var("AIMLINK_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            ..defaults
        }
    }
}

/// Relay server errors.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// The HTTP server stopped with an error.
    #[error("Server error: {0}")]
    Serve(std::io::Error),
}

/// Identity of one signaling connection and the lobby it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionIdentity {
    /// Connection id.
    pub id: ConnectionId,
    /// Remembered `(code, role)`, used on disconnect.
    pub membership: Option<Membership>,
}

/// One occupied place under `max_connections`, released on drop.
#[derive(Debug)]
struct ConnectionSlot {
    counter: Arc<AtomicUsize>,
}

impl ConnectionSlot {
    fn acquire(counter: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| Self { counter: counter.clone() })
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// State shared by every request handler.
#[derive(Clone)]
struct RelayState {
    config: Arc<RelayConfig>,
    registry: Arc<LobbyRegistry>,
    connections: Arc<AtomicUsize>,
    next_id: Arc<AtomicU64>,
    shutdown_tx: broadcast::Sender<()>,
}

/// The relay server.
pub struct RelayServer {
    state: RelayState,
}

impl RelayServer {
    /// Create a new relay server.
    pub fn new(config: RelayConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            state: RelayState {
                config: Arc::new(config),
                registry: Arc::new(LobbyRegistry::new()),
                connections: Arc::new(AtomicUsize::new(0)),
                next_id: Arc::new(AtomicU64::new(1)),
                shutdown_tx,
            },
        }
    }

    /// Bind the configured address and serve until shutdown.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.state.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        info!("Signaling relay listening on {}", listener.local_addr()?);
        let mut shutdown_rx = self.state.shutdown_tx.subscribe();

        axum::serve(
            listener,
            router(self.state.clone()).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("Shutdown signal received");
        })
        .await
        .map_err(RelayError::Serve)
    }

    /// Parse one frame, dispatch it and answer its ack if it asked for one.
    async fn handle_frame(
        registry: &LobbyRegistry,
        identity: &mut ConnectionIdentity,
        participant: &Participant,
        text: &str,
    ) {
        let envelope = match ClientEnvelope::from_json(text) {
            Ok(env) => env,
            Err(e) => {
                debug!("Invalid message from connection {}: {}", identity.id, e);
                participant.notify(invalid_format()).await;
                return;
            }
        };

        debug!("Connection {} -> {}", identity.id, envelope.event.name());
        let reply = Self::dispatch(registry, identity, participant, envelope.event).await;

        if let Some(ack) = envelope.ack {
            participant.notify(ServerEvent::Ack { id: ack, reply }).await;
        }
    }

    /// Apply a client event. Every path yields exactly one ack reply.
    async fn dispatch(
        registry: &LobbyRegistry,
        identity: &mut ConnectionIdentity,
        participant: &Participant,
        event: ClientEvent,
    ) -> AckReply {
        match event {
            ClientEvent::Create => {
                Self::vacate(registry, identity).await;
                let membership = registry.create(participant.clone()).await;
                let code = membership.code.clone();
                identity.membership = Some(membership);

                participant.notify(ServerEvent::Created { code: code.clone() }).await;
                AckReply::with_code(code)
            }
            ClientEvent::Join { code } => match registry.join(participant.clone(), &code).await {
                Ok(membership) => {
                    // The previous lobby is only left once the new seat is taken.
                    Self::vacate(registry, identity).await;
                    identity.membership = Some(membership);
                    participant.notify(ServerEvent::Joined { code: code.clone() }).await;
                    AckReply::with_code(code)
                }
                Err(e) => {
                    info!("Join of {} by connection {} failed: {}", code, identity.id, e);
                    participant.notify(ServerEvent::Error { message: e.to_string() }).await;
                    AckReply::failed(e.to_string())
                }
            },
            ClientEvent::Signal { code, signal } => {
                registry.signal(identity.id, &code, signal).await;
                AckReply::done()
            }
            ClientEvent::Start { code } => {
                registry.start(identity.id, &code).await;
                AckReply::done()
            }
            ClientEvent::Leave { code } => {
                let departure = registry.leave(identity.id, &code).await;
                if departure != Departure::NotMember
                    && identity.membership.as_ref().map(|m| &m.code) == Some(&code)
                {
                    identity.membership = None;
                }
                AckReply::done()
            }
        }
    }

    /// Leave the current lobby before creating or joining another.
    async fn vacate(registry: &LobbyRegistry, identity: &mut ConnectionIdentity) {
        if let Some(previous) = identity.membership.take() {
            debug!("Connection {} leaving lobby {} implicitly", identity.id, previous.code);
            registry.leave(identity.id, &previous.code).await;
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.state.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::Acquire)
    }

    /// Shared handle to the lobby registry.
    pub fn registry(&self) -> Arc<LobbyRegistry> {
        self.state.registry.clone()
    }
}

fn router(state: RelayState) -> Router {
    Router::new()
        .route("/", any(relay_root))
        .fallback(not_found)
        .with_state(state)
}

/// `GET /`: WebSocket upgrade into a signaling session, or liveness text.
async fn relay_root(
    State(state): State<RelayState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    method: Method,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(slot) = ConnectionSlot::acquire(&state.connections, state.config.max_connections) else {
        warn!("Connection limit reached, rejecting {}", addr);
        return (StatusCode::SERVICE_UNAVAILABLE, "relay at capacity").into_response();
    };

    match upgrade {
        Ok(ws) => {
            let id = state.next_id.fetch_add(1, Ordering::Relaxed);
            let shutdown_rx = state.shutdown_tx.subscribe();
            ws.on_failed_upgrade(move |e: axum::Error| error!("WebSocket handshake failed for {}: {}", addr, e))
                .on_upgrade(move |socket| run_session(socket, state, addr, id, slot, shutdown_rx))
        }
        Err(_) if method == Method::GET || method == Method::HEAD => {
            debug!("Liveness request from {}", addr);
            format!("aimlink signaling relay v{} running\n", state.config.version).into_response()
        }
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// One signaling session: writer task plus reader loop, then implicit leave.
async fn run_session(
    socket: WebSocket,
    state: RelayState,
    addr: SocketAddr,
    id: ConnectionId,
    _slot: ConnectionSlot,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    info!("Connection {} opened from {}", id, addr);
    let registry = state.registry;

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (event_tx, mut event_rx) = mpsc::channel::<ServerEvent>(state.config.channel_capacity);
    let participant = Participant::new(id, event_tx);
    let mut identity = ConnectionIdentity { id, membership: None };

    // Spawn message sender task
    let sender_task = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let text = match event.to_json() {
                Ok(t) => t,
                Err(e) => {
                    error!("Failed to serialize event: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    // Handle incoming messages
    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        RelayServer::handle_frame(&registry, &mut identity, &participant, text.as_str()).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        match std::str::from_utf8(&data) {
                            Ok(text) => {
                                RelayServer::handle_frame(&registry, &mut identity, &participant, text).await;
                            }
                            Err(_) => {
                                debug!("Non-UTF-8 binary frame from connection {}", id);
                                participant.notify(invalid_format()).await;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Connection {} closed by peer", id);
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error on connection {}: {}", id, e);
                        break;
                    }
                    _ => {}
                }
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }

    // Cleanup
    match registry.disconnect(id, identity.membership.as_ref()).await {
        Departure::LobbyClosed => info!("Host {} disconnected, lobby closed", id),
        Departure::ClientLeft => info!("Client {} disconnected", id),
        Departure::NotMember => {}
    }
    drop(participant);
    sender_task.abort();

    info!("Connection {} cleaned up", id);
}

fn invalid_format() -> ServerEvent {
    ServerEvent::Error {
        message: "Invalid message format".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::registry::Role;

    fn test_participant(id: ConnectionId) -> (Participant, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (Participant::new(id, tx), rx)
    }

    fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn test_relay_config_default() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr.port(), 3000);
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.channel_capacity, 64);
    }

    #[test]
    fn test_connection_slots_bounded_and_released() {
        let counter = Arc::new(AtomicUsize::new(0));
        let first = ConnectionSlot::acquire(&counter, 2).unwrap();
        let second = ConnectionSlot::acquire(&counter, 2).unwrap();
        assert!(ConnectionSlot::acquire(&counter, 2).is_none());
        assert_eq!(counter.load(Ordering::Acquire), 2);

        drop(first);
        assert_eq!(counter.load(Ordering::Acquire), 1);
        let third = ConnectionSlot::acquire(&counter, 2);
        assert!(third.is_some());

        drop(second);
        drop(third);
        assert_eq!(counter.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn test_server_creation() {
        let config = RelayConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let server = RelayServer::new(config);

        assert_eq!(server.connection_count(), 0);
        assert_eq!(server.registry().lobby_count().await, 0);
    }

    #[tokio::test]
    async fn test_server_shutdown() {
        let server = RelayServer::new(RelayConfig::default());
        server.shutdown();
        // Should not panic
    }

    #[tokio::test]
    async fn test_create_then_join_acks_once() {
        let registry = LobbyRegistry::new();
        let (host, mut host_rx) = test_participant(1);
        let (client, mut client_rx) = test_participant(2);
        let mut host_id = ConnectionIdentity { id: 1, membership: None };
        let mut client_id = ConnectionIdentity { id: 2, membership: None };

        RelayServer::handle_frame(&registry, &mut host_id, &host, r#"{"event":"create","ack":1}"#).await;
        let events = drain(&mut host_rx);
        let code = match &events[..] {
            [ServerEvent::Created { code }, ServerEvent::Ack { id: 1, reply: AckReply::Done { code: Some(acked) } }] => {
                assert_eq!(code, acked);
                code.clone()
            }
            other => panic!("Unexpected events: {:?}", other),
        };
        assert_eq!(host_id.membership.as_ref().map(|m| m.role), Some(Role::Host));

        let join = format!(r#"{{"event":"join","ack":9,"code":"{}"}}"#, code);
        RelayServer::handle_frame(&registry, &mut client_id, &client, &join).await;
        assert_eq!(drain(&mut host_rx), vec![ServerEvent::PeerJoined]);
        assert_eq!(
            drain(&mut client_rx),
            vec![
                ServerEvent::Joined { code: code.clone() },
                ServerEvent::Ack { id: 9, reply: AckReply::with_code(code) },
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_join_reports_error_to_joiner_only() {
        let registry = LobbyRegistry::new();
        let (client, mut client_rx) = test_participant(2);
        let mut identity = ConnectionIdentity { id: 2, membership: None };

        RelayServer::handle_frame(&registry, &mut identity, &client, r#"{"event":"join","ack":4,"code":"000000"}"#).await;
        assert_eq!(
            drain(&mut client_rx),
            vec![
                ServerEvent::Error { message: "Lobby not found".into() },
                ServerEvent::Ack { id: 4, reply: AckReply::failed("Lobby not found") },
            ]
        );
        assert!(identity.membership.is_none());
        assert_eq!(registry.lobby_count().await, 0);
    }

    #[tokio::test]
    async fn test_garbage_frame_answered_with_error() {
        let registry = LobbyRegistry::new();
        let (conn, mut rx) = test_participant(1);
        let mut identity = ConnectionIdentity { id: 1, membership: None };

        RelayServer::handle_frame(&registry, &mut identity, &conn, "{not json").await;
        RelayServer::handle_frame(&registry, &mut identity, &conn, r#"{"event":"explode"}"#).await;
        assert_eq!(drain(&mut rx), vec![invalid_format(), invalid_format()]);
    }

    #[tokio::test]
    async fn test_unacked_events_get_no_ack() {
        let registry = LobbyRegistry::new();
        let (conn, mut rx) = test_participant(1);
        let mut identity = ConnectionIdentity { id: 1, membership: None };

        RelayServer::handle_frame(&registry, &mut identity, &conn, r#"{"event":"start","code":"abcdef"}"#).await;
        RelayServer::handle_frame(&registry, &mut identity, &conn, r#"{"event":"leave","code":"abcdef","ack":2}"#).await;
        assert_eq!(drain(&mut rx), vec![ServerEvent::Ack { id: 2, reply: AckReply::done() }]);
    }

    #[tokio::test]
    async fn test_create_twice_replaces_lobby() {
        let registry = LobbyRegistry::new();
        let (host, mut rx) = test_participant(1);
        let mut identity = ConnectionIdentity { id: 1, membership: None };

        RelayServer::handle_frame(&registry, &mut identity, &host, r#"{"event":"create"}"#).await;
        let first = identity.membership.clone().unwrap().code;
        RelayServer::handle_frame(&registry, &mut identity, &host, r#"{"event":"create"}"#).await;
        let second = identity.membership.clone().unwrap().code;

        assert_ne!(first, second);
        assert!(!registry.is_open(&first).await);
        assert!(registry.is_open(&second).await);
        assert_eq!(drain(&mut rx).len(), 2);
    }

    #[tokio::test]
    async fn test_failed_join_keeps_own_lobby() {
        let registry = LobbyRegistry::new();
        let (host, mut rx) = test_participant(1);
        let mut identity = ConnectionIdentity { id: 1, membership: None };

        RelayServer::handle_frame(&registry, &mut identity, &host, r#"{"event":"create"}"#).await;
        let own = identity.membership.clone().unwrap();
        drain(&mut rx);

        RelayServer::handle_frame(&registry, &mut identity, &host, r#"{"event":"join","code":"zzzzzz","ack":3}"#).await;
        assert_eq!(
            drain(&mut rx),
            vec![
                ServerEvent::Error { message: "Lobby not found".into() },
                ServerEvent::Ack { id: 3, reply: AckReply::failed("Lobby not found") },
            ]
        );
        assert_eq!(identity.membership, Some(own.clone()));
        assert!(registry.is_open(&own.code).await);
        assert_eq!(registry.lobby_count().await, 1);
    }

    #[tokio::test]
    async fn test_full_join_keeps_own_lobby() {
        let registry = LobbyRegistry::new();
        let (host, _host_rx) = test_participant(1);
        let (client, _client_rx) = test_participant(2);
        let (other, mut other_rx) = test_participant(3);
        let mut host_id = ConnectionIdentity { id: 1, membership: None };
        let mut client_id = ConnectionIdentity { id: 2, membership: None };
        let mut other_id = ConnectionIdentity { id: 3, membership: None };

        RelayServer::handle_frame(&registry, &mut host_id, &host, r#"{"event":"create"}"#).await;
        let paired = host_id.membership.clone().unwrap().code;
        let join = format!(r#"{{"event":"join","code":"{}"}}"#, paired);
        RelayServer::handle_frame(&registry, &mut client_id, &client, &join).await;

        RelayServer::handle_frame(&registry, &mut other_id, &other, r#"{"event":"create"}"#).await;
        let own = other_id.membership.clone().unwrap().code;
        drain(&mut other_rx);

        RelayServer::handle_frame(&registry, &mut other_id, &other, &join).await;
        assert_eq!(drain(&mut other_rx), vec![ServerEvent::Error { message: "Lobby full".into() }]);
        assert_eq!(other_id.membership.as_ref().map(|m| &m.code), Some(&own));
        assert!(registry.is_open(&own).await);
        assert_eq!(registry.lobby_count().await, 2);
    }

    #[tokio::test]
    async fn test_successful_join_leaves_previous_lobby() {
        let registry = LobbyRegistry::new();
        let (host, _host_rx) = test_participant(1);
        let (mover, _mover_rx) = test_participant(2);
        let mut host_id = ConnectionIdentity { id: 1, membership: None };
        let mut mover_id = ConnectionIdentity { id: 2, membership: None };

        RelayServer::handle_frame(&registry, &mut host_id, &host, r#"{"event":"create"}"#).await;
        let target = host_id.membership.clone().unwrap().code;
        RelayServer::handle_frame(&registry, &mut mover_id, &mover, r#"{"event":"create"}"#).await;
        let abandoned = mover_id.membership.clone().unwrap().code;

        let join = format!(r#"{{"event":"join","code":"{}"}}"#, target);
        RelayServer::handle_frame(&registry, &mut mover_id, &mover, &join).await;
        assert_eq!(mover_id.membership.as_ref().map(|m| m.role), Some(Role::Client));
        assert!(!registry.is_open(&abandoned).await);
        assert!(registry.is_paired(&target).await);
    }

    #[tokio::test]
    async fn test_client_leave_clears_membership() {
        let registry = LobbyRegistry::new();
        let (host, mut host_rx) = test_participant(1);
        let (client, _client_rx) = test_participant(2);
        let mut host_id = ConnectionIdentity { id: 1, membership: None };
        let mut client_id = ConnectionIdentity { id: 2, membership: None };

        RelayServer::handle_frame(&registry, &mut host_id, &host, r#"{"event":"create"}"#).await;
        let code = host_id.membership.clone().unwrap().code;
        let join = format!(r#"{{"event":"join","code":"{}"}}"#, code);
        RelayServer::handle_frame(&registry, &mut client_id, &client, &join).await;
        drain(&mut host_rx);

        let leave = format!(r#"{{"event":"leave","code":"{}"}}"#, code);
        RelayServer::handle_frame(&registry, &mut client_id, &client, &leave).await;
        assert!(client_id.membership.is_none());
        assert_eq!(drain(&mut host_rx), vec![ServerEvent::PeerLeft]);
        assert!(registry.is_open(&code).await);
    }
}
