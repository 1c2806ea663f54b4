//! WebSocket bridge between browser clients and a serial session.

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serial_link_core::SerialPlatform;
use serial_link_session::ConnectionManager;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

use crate::protocol::{ClientMessage, ServerMessage};

/// WebSocket handler state.
pub struct WsState<P>
where
    P: SerialPlatform,
{
    /// Session shared by every connected client.
    pub manager: ConnectionManager<P>,
}

impl<P> WsState<P>
where
    P: SerialPlatform,
{
    /// Create new WebSocket state.
    #[must_use]
    pub const fn new(manager: ConnectionManager<P>) -> Self {
        Self { manager }
    }
}

impl<P> Clone for WsState<P>
where
    P: SerialPlatform,
{
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
        }
    }
}

/// WebSocket upgrade handler.
///
/// Use this as an Axum route handler.
pub async fn ws_handler<P>(
    ws: WebSocketUpgrade,
    State(state): State<WsState<P>>,
) -> impl IntoResponse
where
    P: SerialPlatform,
{
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Snapshot of the session as sent to clients.
#[must_use]
pub fn state_message<P>(manager: &ConnectionManager<P>) -> ServerMessage
where
    P: SerialPlatform,
{
    ServerMessage::State {
        state: manager.state(),
        baud_rate: manager.baud_rate(),
        can_use_serial: manager.can_use_serial(),
    }
}

/// Apply one client command to the session.
///
/// Returns the direct reply, if any. State changes reach the client through
/// the state forwarder instead.
pub async fn handle_command<P>(
    manager: &ConnectionManager<P>,
    msg: ClientMessage,
) -> Option<ServerMessage>
where
    P: SerialPlatform,
{
    match msg {
        ClientMessage::Ping => Some(ServerMessage::Pong),
        ClientMessage::Connect => manager
            .try_connect()
            .await
            .err()
            .map(|e| ServerMessage::error(format!("Connect failed: {e}"))),
        ClientMessage::Disconnect => {
            manager.disconnect().await;
            None
        }
        ClientMessage::SetBaudRate { baud_rate } => {
            if manager.set_baud_rate(baud_rate) {
                Some(state_message(manager))
            } else {
                Some(ServerMessage::error(format!(
                    "Cannot change baud rate while port is {}",
                    manager.state()
                )))
            }
        }
        msg @ ClientMessage::Send { .. } => {
            let Some(data) = msg.decode_send() else {
                return Some(ServerMessage::error("Invalid base64 payload"));
            };
            manager
                .try_send(&data)
                .await
                .err()
                .map(|e| ServerMessage::error(format!("Send failed: {e}")))
        }
    }
}

async fn handle_socket<P>(socket: WebSocket, state: WsState<P>)
where
    P: SerialPlatform,
{
    let (mut sender, mut receiver) = socket.split();
    let manager = state.manager;

    // Channel for sending messages to the client
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    // Spawn task to forward messages to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize message: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // Forward session state and serial messages
    let forward_task = {
        let manager = manager.clone();
        let tx = tx.clone();
        let mut states = manager.watch_state();
        let mut messages = manager.message_stream();

        tokio::spawn(async move {
            if tx.send(state_message(&manager)).is_err() {
                return;
            }
            loop {
                let msg = tokio::select! {
                    changed = states.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        state_message(&manager)
                    }
                    message = messages.next() => match message {
                        Some(message) => ServerMessage::from(message),
                        None => break,
                    },
                };
                if tx.send(msg).is_err() {
                    break;
                }
            }
        })
    };

    // Handle incoming messages
    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(Message::Text(text)) => text.as_str().to_owned(),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!("WebSocket error: {e}");
                break;
            }
        };

        let client_msg: ClientMessage = match serde_json::from_str(&msg) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Invalid client message: {e}");
                let _ = tx.send(ServerMessage::error(format!("Invalid message: {e}")));
                continue;
            }
        };

        if let Some(reply) = handle_command(&manager, client_msg).await {
            let _ = tx.send(reply);
        }
    }

    forward_task.abort();
    send_task.abort();
    tracing::debug!("WebSocket client disconnected");
}

/// Create WebSocket router serving `manager` on `/ws`.
///
/// # Example
/// ```ignore
/// let app = Router::new()
///     .merge(create_ws_router(manager));
/// ```
#[must_use]
pub fn create_ws_router<P>(manager: ConnectionManager<P>) -> axum::Router
where
    P: SerialPlatform,
{
    axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler::<P>))
        .with_state(WsState::new(manager))
        .layer(TraceLayer::new_for_http())
}
