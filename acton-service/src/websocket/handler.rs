//! Connection Handler: the WebSocket upgrade, accept sequence,
//! wire protocol dispatch, and disconnect teardown.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::header::ORIGIN;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::auth::login::Identity;
use crate::config::CollabConfig;
use crate::crdt::presence;
use crate::state::AppState;

use super::messages::{AttachResult, RoomCommand};
use super::rooms::RoomId;

/// Numeric tag identifying one attached socket. Doubles as the CRDT
/// transaction origin for every update that socket sends (`as_origin_tag`),
/// so the doc's update observer can skip re-broadcasting to its own sender.
/// Tag `0` is reserved (`crate::crdt::SYSTEM_ORIGIN`); live connections start
/// at `1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

impl ConnectionId {
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_origin_tag(self) -> crate::crdt::ConnOrigin {
        crate::crdt::ConnOrigin::new(self.0)
    }

    /// Reconstruct the `ConnectionId` that produced a given origin tag, so
    /// the doc update observer can exclude the originating socket from its
    /// re-broadcast. Never used to mint a *new* connection's id.
    pub(crate) fn from_origin_tag(tag: u64) -> Self {
        Self(tag)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Wire tags for the two binary frame kinds.
const SYNC_TAG: u8 = 0;
const AWARENESS_TAG: u8 = 1;

/// Close codes the accept sequence and disconnect path use.
mod close_code {
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const INTERNAL_ERROR: u16 = 1011;
    pub const GOING_AWAY: u16 = 1012;
}

/// Both fields are optional at the extractor level so a missing `token` or
/// `room` fails *inside* `handle_socket` (close 1008) rather than as a
/// pre-handshake `Query<T>` rejection, which would return a plain HTTP 400
/// before `ws.on_upgrade()` ever runs.
#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    pub token: Option<String>,
    pub room: Option<String>,
}

#[derive(Debug, Serialize)]
struct Welcome<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    message: &'static str,
    #[serde(rename = "roomId")]
    room_id: &'a str,
    user: WelcomeUser<'a>,
}

#[derive(Debug, Serialize)]
struct WelcomeUser<'a> {
    #[serde(rename = "userId")]
    user_id: &'a str,
    username: &'a str,
    role: crate::role::Role,
}

/// `GET /ws?token=...&room=...` upgrade endpoint.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState<CollabConfig>>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query, headers))
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState<CollabConfig>,
    query: ConnectQuery,
    headers: HeaderMap,
) {
    use futures::{SinkExt, StreamExt};

    let collab = state.collab();
    let (mut sink, mut stream) = socket.split();

    if collab.shutting_down.load(Ordering::SeqCst) {
        let _ = sink
            .send(close_message(close_code::GOING_AWAY, "server is shutting down"))
            .await;
        return;
    }

    if let Some(origin) = headers.get(ORIGIN).and_then(|v| v.to_str().ok()) {
        if !collab.allowed_origins.is_empty() && !collab.allowed_origins.iter().any(|o| o == origin)
        {
            let _ = sink
                .send(close_message(close_code::POLICY_VIOLATION, "origin not allowed"))
                .await;
            return;
        }
    }

    let Some(token) = query.token.as_deref() else {
        let _ = sink
            .send(close_message(close_code::POLICY_VIOLATION, "missing token"))
            .await;
        return;
    };

    let Some(room_param) = query.room.as_deref() else {
        let _ = sink
            .send(close_message(close_code::POLICY_VIOLATION, "missing room"))
            .await;
        return;
    };

    let Some(identity) = collab.verifier.verify(token) else {
        let _ = sink
            .send(close_message(close_code::POLICY_VIOLATION, "invalid token"))
            .await;
        return;
    };

    let Ok(room_id) = RoomId::parse(room_param) else {
        let _ = sink
            .send(close_message(close_code::POLICY_VIOLATION, "invalid room id"))
            .await;
        return;
    };

    let room = match collab.registry.get_or_create(room_id.clone()).await {
        Ok(room) => room,
        Err(err) => {
            tracing::error!(room = %room_id, error = %err, "failed to obtain room");
            let _ = sink
                .send(close_message(close_code::INTERNAL_ERROR, "room unavailable"))
                .await;
            return;
        }
    };

    let conn_id = ConnectionId::next();
    let (socket_tx, mut socket_rx) = mpsc::unbounded_channel::<Message>();
    let direct_tx = socket_tx.clone();

    let (reply_tx, reply_rx) = oneshot::channel();
    if room
        .send(RoomCommand::AttachSocket {
            conn_id,
            identity: identity.clone(),
            sender: socket_tx,
            reply: reply_tx,
        })
        .is_err()
    {
        let _ = sink
            .send(close_message(close_code::INTERNAL_ERROR, "room unavailable"))
            .await;
        return;
    }
    let Ok(AttachResult {
        sync_snapshot,
        awareness_snapshot,
    }) = reply_rx.await
    else {
        let _ = sink
            .send(close_message(close_code::INTERNAL_ERROR, "room unavailable"))
            .await;
        return;
    };

    let welcome = serde_json::to_string(&Welcome {
        kind: "welcome",
        message: "connected",
        room_id: room_id.as_str(),
        user: WelcomeUser {
            user_id: &identity.user_id,
            username: &identity.username,
            role: identity.role,
        },
    })
    .expect("welcome payload always serializes");
    if sink.send(Message::Text(welcome.into())).await.is_err() {
        room.send_detach(conn_id);
        return;
    }

    let mut sync_frame = Vec::with_capacity(sync_snapshot.len() + 1);
    sync_frame.push(SYNC_TAG);
    sync_frame.extend_from_slice(&sync_snapshot);
    if sink.send(Message::Binary(sync_frame.into())).await.is_err() {
        room.send_detach(conn_id);
        return;
    }

    if !awareness_snapshot.is_empty() {
        let mut awareness_frame = Vec::with_capacity(awareness_snapshot.len() + 1);
        awareness_frame.push(AWARENESS_TAG);
        awareness_frame.extend_from_slice(&awareness_snapshot);
        if sink.send(Message::Binary(awareness_frame.into())).await.is_err() {
            room.send_detach(conn_id);
            return;
        }
    }

    let writer = tokio::spawn(async move {
        while let Some(message) = socket_rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    loop {
        match stream.next().await {
            Some(Ok(message)) => {
                if !dispatch(&room, conn_id, &identity, &direct_tx, message) {
                    break;
                }
            }
            Some(Err(err)) => {
                tracing::debug!(conn = %conn_id, error = %err, "websocket read error");
                break;
            }
            None => break,
        }
    }

    room.send_detach(conn_id);
    writer.abort();
}

/// Handle one inbound frame. Returns `false` to tear the connection down.
fn dispatch(
    room: &super::rooms::RoomHandle,
    conn_id: ConnectionId,
    identity: &Identity,
    direct_tx: &mpsc::UnboundedSender<Message>,
    message: Message,
) -> bool {
    match message {
        Message::Binary(bytes) => {
            let Some((&tag, payload)) = bytes.split_first() else {
                return true;
            };
            match tag {
                SYNC_TAG => {
                    let _ = room.send(RoomCommand::ApplySync {
                        conn_id,
                        identity: identity.clone(),
                        bytes: payload.to_vec(),
                    });
                }
                AWARENESS_TAG => match presence::decode(payload) {
                    Ok(changes) => {
                        let _ = room.send(RoomCommand::ApplyAwareness {
                            conn_id,
                            changes,
                        });
                    }
                    Err(err) => {
                        tracing::debug!(conn = %conn_id, error = %err, "dropping malformed awareness frame");
                    }
                },
                _ => tracing::debug!(conn = %conn_id, tag, "dropping frame with unknown tag"),
            }
            true
        }
        Message::Text(text) => {
            if text == "ping" {
                let _ = direct_tx.send(Message::Text("pong".into()));
                return true;
            }
            if let Ok(chat) = serde_json::from_str::<ChatEnvelope>(&text) {
                let trimmed = chat.text.trim();
                if chat.kind == "chat" && !trimmed.is_empty() {
                    let _ = room.send(RoomCommand::Chat {
                        conn_id,
                        identity: identity.clone(),
                        text: trimmed.to_string(),
                    });
                }
            }
            true
        }
        Message::Close(_) => false,
        Message::Ping(_) | Message::Pong(_) => true,
    }
}

#[derive(Debug, Deserialize)]
struct ChatEnvelope {
    #[serde(rename = "type")]
    kind: String,
    text: String,
}

fn close_message(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_ids_are_unique_and_nonzero() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
        assert_ne!(a.as_origin_tag(), crate::crdt::SYSTEM_ORIGIN);
    }
}
