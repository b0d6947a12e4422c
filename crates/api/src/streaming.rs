//! WebSocket streaming API.
//!
//! `GET /streaming?i=<token>` upgrades to a socket bound to one presence
//! connection. Server pushes arrive on the connection's sink; client
//! messages join and leave rooms or mark notifications read.

use std::sync::Arc;

use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tidings_common::{AppError, IdGenerator};
use tidings_core::{OutboundMessage, PresenceTracker, Room};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::middleware::AppState;

/// Streaming query parameters.
#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Access token for authentication.
    #[serde(rename = "i")]
    pub token: Option<String>,
}

/// Client-to-server message.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Start viewing a content or party room.
    Join { room: String },
    /// Stop viewing a room.
    Leave { room: String },
    /// Mark a notification read.
    ReadNotification { id: String },
}

/// Disconnects the presence connection when the socket task ends, however
/// it ends.
struct DisconnectGuard {
    presence: Arc<PresenceTracker>,
    conn_id: String,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        let presence = Arc::clone(&self.presence);
        let conn_id = std::mem::take(&mut self.conn_id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    presence.disconnect(&conn_id).await;
                });
            }
            Err(_) => warn!(conn_id = %conn_id, "No runtime to disconnect on"),
        }
    }
}

fn error_message(e: &AppError) -> OutboundMessage {
    OutboundMessage::new("error", json!({ "message": e.to_string() }))
}

/// WebSocket handler for streaming.
pub async fn streaming_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<StreamQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, query, state))
}

async fn send(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    message: &OutboundMessage,
) -> bool {
    match serde_json::to_string(message) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            error!(error = %e, "Failed to serialize outbound message");
            true
        }
    }
}

/// Handle a WebSocket connection.
async fn handle_socket(socket: WebSocket, query: StreamQuery, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let conn_id = IdGenerator::new().generate_connection_id();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let token = query.token.unwrap_or_default();

    let user = match state.presence.connect(&conn_id, &token, tx).await {
        Ok(user) => user,
        Err(e) => {
            warn!(conn_id = %conn_id, error = %e, "Streaming auth failed");
            send(&mut sender, &error_message(&e)).await;
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };
    let _guard = DisconnectGuard {
        presence: Arc::clone(&state.presence),
        conn_id: conn_id.clone(),
    };

    info!(conn_id = %conn_id, user_id = %user.id, "Streaming connection established");

    let hello = OutboundMessage::new(
        "connected",
        json!({ "userId": user.id, "connectionId": conn_id }),
    );
    if !send(&mut sender, &hello).await {
        return;
    }

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                let Some(incoming) = incoming else { break };
                match incoming {
                    Ok(Message::Text(text)) => {
                        let reply = match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(msg) => handle_client_message(&state, &conn_id, &user.id, msg).await,
                            Err(e) => {
                                debug!(conn_id = %conn_id, error = %e, "Unparseable client message");
                                error_message(&AppError::Validation(format!("Invalid message: {e}")))
                            }
                        };
                        if !send(&mut sender, &reply).await {
                            break;
                        }
                    }
                    Ok(Message::Ping(data)) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!(conn_id = %conn_id, "Client closed connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(conn_id = %conn_id, error = %e, "WebSocket error");
                        break;
                    }
                }
            }
            Some(push) = rx.recv() => {
                if !send(&mut sender, &push).await {
                    break;
                }
            }
        }
    }

    info!(conn_id = %conn_id, "Streaming connection closed");
}

/// Apply one client message and build the acknowledgement.
pub async fn handle_client_message(
    state: &AppState,
    conn_id: &str,
    user_id: &str,
    msg: ClientMessage,
) -> OutboundMessage {
    let result = match msg {
        ClientMessage::Join { room } => match room.parse::<Room>() {
            Ok(parsed) => state
                .presence
                .join_room(conn_id, &parsed)
                .await
                .map(|()| OutboundMessage::new("joined", json!({ "room": room }))),
            Err(e) => Err(e),
        },
        ClientMessage::Leave { room } => match room.parse::<Room>() {
            Ok(parsed) => state
                .presence
                .leave_room(conn_id, &parsed)
                .await
                .map(|()| OutboundMessage::new("left", json!({ "room": room }))),
            Err(e) => Err(e),
        },
        ClientMessage::ReadNotification { id } => state
            .notification_service
            .mark_as_read(&id, user_id)
            .await
            .map(|changed| {
                OutboundMessage::new("notificationRead", json!({ "id": id, "changed": changed }))
            }),
    };

    result.unwrap_or_else(|e| {
        debug!(conn_id, error = %e, "Client message rejected");
        error_message(&e)
    })
}
