//! Connection handlers for the Courier server.
//!
//! This module handles the connection lifecycle and frame processing.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::BytesMut;
use courier_core::{
    AllowAll, Authenticator, Event, Handshake, HandshakeGate, HubEvent, LocalHub, LoginRequest,
    Node, StaticCredentials, TokenGate,
};
use courier_protocol::{codec, frames::codes, Frame, ProtocolError};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The routing node.
    pub node: Node,
    /// Server configuration.
    pub config: Config,
    /// Handshake authorization.
    pub gate: Arc<dyn HandshakeGate>,
    next_connection: AtomicU64,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(node: Node, config: Config, gate: Arc<dyn HandshakeGate>) -> Self {
        Self {
            node,
            config,
            gate,
            next_connection: AtomicU64::new(1),
        }
    }

    fn connection_id(&self) -> String {
        format!("conn_{}", self.next_connection.fetch_add(1, Ordering::Relaxed))
    }
}

fn authenticator(config: &Config) -> Arc<dyn Authenticator> {
    if config.auth.users.is_empty() {
        Arc::new(AllowAll)
    } else {
        Arc::new(StaticCredentials::new(config.auth.users.clone()))
    }
}

fn handshake_gate(config: &Config) -> Arc<dyn HandshakeGate> {
    match &config.handshake.token {
        Some(token) => Arc::new(TokenGate::new(token.clone())),
        None => Arc::new(AllowAll),
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the broker or the listener cannot be set up.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let brokers = crate::broker::connect(&config.broker).await?;
    let node = Node::start(
        config.node_config(),
        brokers,
        Arc::new(LocalHub::new()),
        authenticator(&config),
    )
    .await?;
    let events = node.subscribe_events();

    let gate = handshake_gate(&config);
    let state = Arc::new(AppState::new(node, config.clone(), gate));
    tokio::spawn(track_lifecycle(state.clone(), events));

    // Build router
    let app = Router::new()
        .route(&config.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state.clone());

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Courier server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, config.websocket_path);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    state.node.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

/// Feed lifecycle events into metrics.
async fn track_lifecycle(state: Arc<AppState>, mut events: broadcast::Receiver<Event>) {
    loop {
        match events.recv().await {
            Ok(Event::LoggedIn { .. }) => {
                metrics::record_login(true);
                metrics::set_active_identities(active_identities(&state.node));
            }
            Ok(Event::LoginFailed { .. }) => metrics::record_login(false),
            Ok(Event::Disconnected { .. }) => {
                metrics::set_active_identities(active_identities(&state.node));
            }
            Ok(Event::Connected { .. }) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped = skipped, "Lifecycle metrics lagged");
                metrics::set_active_identities(active_identities(&state.node));
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Identities currently registered on the node.
fn active_identities(node: &Node) -> usize {
    node.registry().len()
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.node.hub().connection_count(),
        "identities": state.node.registry().len(),
    }))
}

/// Token from an `Authorization: Bearer` header.
fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let handshake = Handshake {
        remote_addr: Some(remote.to_string()),
        token: params.get("token").cloned().or_else(|| bearer_token(&headers)),
    };

    if let Err(e) = state.gate.authorize(&handshake).await {
        debug!(remote = %remote, error = %e, "Handshake refused");
        metrics::record_error("handshake");
        return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
    }

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state))
        .into_response()
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = state.connection_id();
    let mut outbox = state.node.connect(&connection_id);

    // Split the WebSocket
    let (mut sender, mut receiver) = socket.split();

    if send_frame(&mut sender, &Frame::connected(&connection_id))
        .await
        .is_err()
    {
        error!(connection = %connection_id, "Failed to send Connected frame");
        state.node.disconnect(&connection_id).await;
        return;
    }

    // Read buffer for partial frames
    let mut read_buffer = BytesMut::with_capacity(4096);
    let limit = state.config.limits.max_message_size;

    // Message processing loop
    'session: loop {
        tokio::select! {
            biased;

            // Events routed to this connection
            event = outbox.recv() => {
                let Some(HubEvent { event, payload }) = event else {
                    debug!(connection = %connection_id, "Hub closed");
                    break;
                };
                if send_frame(&mut sender, &Frame::event(event, payload)).await.is_err() {
                    break;
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        metrics::record_frame(data.len(), "inbound");
                        read_buffer.extend_from_slice(&data);
                    }
                    Some(Ok(Message::Text(text))) => {
                        // Treat text as binary
                        metrics::record_frame(text.len(), "inbound");
                        read_buffer.extend_from_slice(text.as_bytes());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }

                // Decode every complete frame in the buffer
                loop {
                    let start = Instant::now();
                    let reply = match codec::decode_from(&mut read_buffer, limit) {
                        Ok(Some(frame)) => handle_frame(&state.node, &connection_id, frame).await,
                        Ok(None) => break,
                        Err(e @ ProtocolError::FrameTooLarge { .. }) => {
                            // The stream cannot be resynchronised past an
                            // oversized prefix.
                            warn!(connection = %connection_id, error = %e, "Closing connection");
                            metrics::record_error("frame_too_large");
                            let _ = send_frame(
                                &mut sender,
                                &Frame::error(0, codes::FRAME_TOO_LARGE, e.to_string()),
                            )
                            .await;
                            break 'session;
                        }
                        Err(e) => {
                            debug!(connection = %connection_id, error = %e, "Invalid frame");
                            metrics::record_error("decode");
                            Some(Frame::error(0, codes::INVALID_FRAME, e.to_string()))
                        }
                    };
                    metrics::record_latency(start.elapsed().as_secs_f64());

                    if let Some(reply) = reply {
                        if send_frame(&mut sender, &reply).await.is_err() {
                            break 'session;
                        }
                    }
                }
            }
        }
    }

    state.node.disconnect(&connection_id).await;
    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Handle a decoded frame, returning the reply to send back, if any.
async fn handle_frame(node: &Node, connection_id: &str, frame: Frame) -> Option<Frame> {
    match frame {
        Frame::Login {
            id,
            identity,
            credential,
        } => {
            debug!(connection = %connection_id, identity = %identity, "Login request");
            let response = node
                .login(connection_id, LoginRequest::new(identity, credential))
                .await;
            Some(match response.error {
                None => Frame::login_ok(id),
                Some(reason) => Frame::login_failed(id, reason),
            })
        }

        Frame::Send {
            id,
            target,
            event,
            payload,
        } => {
            if node.identity_of(connection_id).is_none() {
                return Some(Frame::error(
                    id.unwrap_or(0),
                    codes::NOT_AUTHENTICATED,
                    "Login required",
                ));
            }

            let target = target.unwrap_or_default();
            let route = node.send(&target, &event, payload).await;
            metrics::record_route(&route);
            debug!(connection = %connection_id, target = %target, route = ?route, "Sent");

            // Acknowledge if requested
            id.map(Frame::ack)
        }

        Frame::Ping { timestamp } => Some(Frame::pong(timestamp)),

        Frame::Pong { .. } => None,

        other => {
            warn!(connection = %connection_id, frame_type = ?other.frame_type(), "Unexpected frame type");
            Some(Frame::error(
                0,
                codes::UNEXPECTED_FRAME,
                format!("Unexpected frame: {:?}", other.frame_type()),
            ))
        }
    }
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut SplitSink<WebSocket, Message>, frame: &Frame) -> Result<()> {
    let data = codec::encode(frame)?;
    metrics::record_frame(data.len(), "outbound");
    sender.send(Message::Binary(data.to_vec())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{BrokerClients, MemoryBroker, NodeConfig};
    use serde_json::json;

    async fn node() -> Node {
        Node::start(
            NodeConfig::default(),
            BrokerClients::single(Arc::new(MemoryBroker::new().client())),
            Arc::new(LocalHub::new()),
            Arc::new(StaticCredentials::default().with_user("t100n", "secret")),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_send_requires_login() {
        let node = node().await;
        let _outbox = node.connect("conn-1");

        let reply = handle_frame(&node, "conn-1", Frame::send("ojogador", "message", json!(1))).await;
        assert!(matches!(
            reply,
            Some(Frame::Error { code: codes::NOT_AUTHENTICATED, .. })
        ));
    }

    #[tokio::test]
    async fn test_login_then_send() {
        let node = node().await;
        let mut outbox = node.connect("conn-1");

        let reply = handle_frame(&node, "conn-1", Frame::login(7, "t100n", "nope")).await;
        assert_eq!(
            reply,
            Some(Frame::LoginResult {
                id: 7,
                error: Some("Invalid account".into()),
            })
        );

        let reply = handle_frame(&node, "conn-1", Frame::login(8, "t100n", "secret")).await;
        assert_eq!(reply, Some(Frame::login_ok(8)));

        let send = Frame::Send {
            id: Some(9),
            target: Some("t100n".into()),
            event: "message".into(),
            payload: json!("hi"),
        };
        assert_eq!(handle_frame(&node, "conn-1", send).await, Some(Frame::ack(9)));
        assert_eq!(outbox.recv().await.unwrap(), HubEvent::new("message", json!("hi")));
    }

    #[tokio::test]
    async fn test_ping_and_unexpected_frames() {
        let node = node().await;
        let _outbox = node.connect("conn-1");

        assert_eq!(
            handle_frame(&node, "conn-1", Frame::pong(Some(5))).await,
            None
        );
        assert!(matches!(
            handle_frame(&node, "conn-1", Frame::Ping { timestamp: Some(5) }).await,
            Some(Frame::Pong { timestamp: Some(5) })
        ));
        assert!(matches!(
            handle_frame(&node, "conn-1", Frame::ack(1)).await,
            Some(Frame::Error { code: codes::UNEXPECTED_FRAME, .. })
        ));
    }

    #[tokio::test]
    async fn test_broadcast_frame_reaches_local_connections() {
        let node = node().await;
        let mut first = node.connect("conn-1");
        let mut second = node.connect("conn-2");
        handle_frame(&node, "conn-1", Frame::login(1, "t100n", "secret")).await;

        let broadcast = Frame::Send {
            id: None,
            target: None,
            event: "notice".into(),
            payload: json!("hi"),
        };
        let reply = handle_frame(&node, "conn-1", broadcast).await;
        assert_eq!(reply, None);
        assert_eq!(first.recv().await.unwrap(), HubEvent::new("notice", json!("hi")));
        assert_eq!(second.recv().await.unwrap(), HubEvent::new("notice", json!("hi")));
    }

    #[tokio::test]
    async fn test_active_identities_follow_registry() {
        let node = node().await;
        let _first = node.connect("conn-1");
        let _second = node.connect("conn-2");

        handle_frame(&node, "conn-1", Frame::login(1, "t100n", "secret")).await;
        handle_frame(&node, "conn-2", Frame::login(2, "t100n", "secret")).await;
        assert_eq!(active_identities(&node), 1);

        // The displaced connection leaves without an identity.
        node.disconnect("conn-1").await;
        assert_eq!(active_identities(&node), 1);

        node.disconnect("conn-2").await;
        assert_eq!(active_identities(&node), 0);
    }

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, "Bearer letmein".parse().unwrap());
        assert_eq!(bearer_token(&headers).as_deref(), Some("letmein"));

        headers.insert(header::AUTHORIZATION, "Basic Zm9vOmJhcg==".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }

    #[tokio::test]
    async fn test_gate_selection() {
        let mut config = Config::default();
        assert!(handshake_gate(&config)
            .authorize(&Handshake::default())
            .await
            .is_ok());

        config.handshake.token = Some("letmein".into());
        let gate = handshake_gate(&config);
        let allowed = Handshake {
            token: Some("letmein".into()),
            ..Handshake::default()
        };
        assert!(gate.authorize(&Handshake::default()).await.is_err());
        assert!(gate.authorize(&allowed).await.is_ok());
    }
}
