//! Real-time collaboration transport: the WebSocket upgrade/accept sequence
//! (`handler`), the per-room socket fan-out (`broadcast`), the Room actor
//! and Room Registry (`rooms`), and the mailbox messages that tie them
//! together (`messages`).
//!
//! WebSocket connections upgrade from HTTP on the same port as the REST
//! surface, so the whole collaboration engine mounts on one Axum router.

mod broadcast;
mod handler;
mod messages;
mod rooms;

pub use broadcast::SocketRegistry;
pub use handler::{ws_handler, ConnectQuery, ConnectionId};
pub use messages::{AttachResult, RoomCommand};
pub use rooms::{InvalidRoomId, RoomHandle, RoomId, RoomRegistryHandle};

// Re-export axum WebSocket types for convenience
pub use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
