//! Connection gateway
//!
//! One task per WebSocket. It decodes inbound frames, dispatches them through
//! `handlers::handle_message`, and drains the connection's outbound queue onto
//! the socket. Direct replies go through the same queue as session events so
//! the client sees them in the order they were produced.
//!
//! The task pings the client every `ServerConfig::ping_period`. Any inbound
//! frame, pongs included, resets the idle timer; a client that stays silent
//! through `idle_timeout` is treated as gone.

pub mod handlers;
mod host;
mod student;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    middleware,
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use tokio::time::{Instant, MissedTickBehavior};

use crate::abuse;
use crate::broadcast::{connection_channel, ConnectionReceiver, ConnectionSender, Outbound};
use crate::error::ErrorKind;
use crate::protocol::{ClientMessage, ServerMessage, PROTOCOL_VERSION};
use crate::state::{AppState, Departure};
use crate::types::{ConnectionId, Role, SessionCode, SessionInstanceId};

/// The session a connection is attached to, and as what
#[derive(Debug, Clone)]
pub struct Binding {
    pub code: SessionCode,
    pub instance_id: SessionInstanceId,
    pub role: Role,
}

/// Per-connection context held by the gateway task
pub struct Connection {
    pub id: ConnectionId,
    pub sender: ConnectionSender,
    pub binding: Option<Binding>,
}

impl Connection {
    pub fn new() -> (Self, ConnectionReceiver) {
        let (sender, receiver) = connection_channel();
        let connection = Self {
            id: ulid::Ulid::new().to_string(),
            sender,
            binding: None,
        };
        (connection, receiver)
    }

    pub fn bind(&mut self, code: SessionCode, instance_id: SessionInstanceId, role: Role) {
        tracing::debug!(connection = %self.id, session = %code, role = ?role, "Connection bound");
        self.binding = Some(Binding {
            code,
            instance_id,
            role,
        });
    }

    /// Role held in the session with this (raw) code, if bound to it
    pub fn role_in(&self, raw_code: &str) -> Option<Role> {
        let code = SessionCode::normalize(raw_code);
        self.binding
            .as_ref()
            .filter(|b| b.code == code)
            .map(|b| b.role)
    }

    /// Queue a message behind any session events already pending
    pub fn send(&self, msg: ServerMessage) {
        if self.sender.send(Outbound::Event(msg)).is_err() {
            tracing::debug!(connection = %self.id, "Outbound queue closed");
        }
    }

    /// Apply a queued item, returning the event to write to the socket
    pub fn apply(&mut self, item: Outbound) -> Option<ServerMessage> {
        match item {
            Outbound::Event(msg) => Some(msg),
            Outbound::Detach { session } => {
                if self.binding.as_ref().is_some_and(|b| b.code == session) {
                    tracing::debug!(connection = %self.id, session = %session, "Connection detached");
                    self.binding = None;
                }
                None
            }
        }
    }
}

fn protocol_error(code: &str, kind: ErrorKind, message: String) -> ServerMessage {
    ServerMessage::Error {
        code: code.to_string(),
        kind,
        message,
    }
}

/// Report transport loss to the bound session, if any
pub async fn close_connection(connection: &mut Connection, state: &Arc<AppState>) -> Departure {
    let Some(binding) = connection.binding.take() else {
        return Departure::Unknown;
    };

    match state.registry.lookup(binding.code.as_str()).await {
        Ok(handle) if handle.instance_id == binding.instance_id => {
            handle.disconnect(connection.id.clone()).await
        }
        _ => Departure::Unknown,
    }
}

/// The `/ws` route behind the anti-abuse middleware
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .layer(middleware::from_fn_with_state(
            state.abuse.clone(),
            abuse::ws_abuse_middleware,
        ))
        .with_state(state)
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle individual WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let (mut connection, mut outbound) = Connection::new();
    let rate_limiter = state.abuse.rate_limiter.clone();
    let idle_timeout = state.config.idle_timeout;

    tracing::info!(connection = %connection.id, "WebSocket connected");

    let welcome = ServerMessage::Welcome {
        connection_id: connection.id.clone(),
        protocol: PROTOCOL_VERSION.to_string(),
        server_now: chrono::Utc::now(),
    };

    if let Ok(msg) = serde_json::to_string(&welcome) {
        if sender.send(Message::Text(msg.into())).await.is_err() {
            tracing::error!(connection = %connection.id, "Failed to send welcome message");
            return;
        }
    }

    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);

    let mut heartbeat = tokio::time::interval(state.config.ping_period());
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    heartbeat.tick().await;

    loop {
        tokio::select! {
            // Session events and direct replies, in production order
            item = outbound.recv() => {
                let Some(item) = item else { break };
                if let Some(msg) = connection.apply(item) {
                    match serde_json::to_string(&msg) {
                        Ok(json) => {
                            if sender.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::error!("Failed to serialize server message: {}", e),
                    }
                }
            }

            _ = heartbeat.tick() => {
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }

            _ = &mut idle => {
                tracing::info!(connection = %connection.id, "No frames or pongs within idle timeout, closing");
                break;
            }

            // Handle client messages; pongs count as activity too
            ws_msg = receiver.next() => {
                idle.as_mut().reset(Instant::now() + idle_timeout);

                match ws_msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(limiter) = &rate_limiter {
                            if !limiter.check(&connection.id).await {
                                tracing::warn!(connection = %connection.id, "Rate limited");
                                connection.send(protocol_error(
                                    "RATE_LIMITED",
                                    ErrorKind::ResourceExhausted,
                                    "Too many messages, slow down".to_string(),
                                ));
                                continue;
                            }
                        }

                        tracing::debug!(connection = %connection.id, "Received message: {}", text);

                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(client_msg) => {
                                if let Some(response) =
                                    handlers::handle_message(client_msg, &mut connection, &state).await
                                {
                                    connection.send(response);
                                }
                            }
                            Err(e) => {
                                tracing::warn!(connection = %connection.id, "Failed to parse client message: {}", e);
                                connection.send(protocol_error(
                                    "PARSE_ERROR",
                                    ErrorKind::InvalidInput,
                                    format!("Invalid message format: {}", e),
                                ));
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        tracing::info!(connection = %connection.id, "WebSocket closed");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(connection = %connection.id, "WebSocket error: {}", e);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    let departure = close_connection(&mut connection, &state).await;
    if let Some(limiter) = &rate_limiter {
        limiter.forget(&connection.id).await;
    }

    tracing::info!(
        connection = %connection.id,
        departure = ?departure,
        "WebSocket connection closed"
    );
}
