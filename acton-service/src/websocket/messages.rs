//! Mailbox messages for the Room actor.
//!
//! The Room is a hand-rolled `tokio::task` + `mpsc` actor rather than an
//! agent on an async message-reply framework: every operation here ends up
//! inside a `yrs` transaction or touches the in-process socket registry,
//! neither of which such a framework wraps, so driving them through a
//! plain command channel keeps the unsafe surface to what `tokio`/`yrs`
//! themselves guarantee.

use axum::extract::ws::Message;
use tokio::sync::{mpsc, oneshot};

use crate::auth::login::Identity;
use crate::crdt::PresenceChange;
use crate::error::Error;
use crate::role::Role;

use super::handler::ConnectionId;

/// Returned to a newly attached socket: a consistent snapshot taken in the
/// same mailbox turn the attach is processed, so nothing mutates the doc or
/// presence between "you're attached" and "here's the current state".
#[derive(Debug, Clone)]
pub struct AttachResult {
    pub sync_snapshot: Vec<u8>,
    pub awareness_snapshot: Vec<u8>,
}

#[derive(Debug)]
pub enum RoomCommand {
    /// A socket finished its accept sequence and wants to join the room.
    AttachSocket {
        conn_id: ConnectionId,
        identity: Identity,
        sender: mpsc::UnboundedSender<Message>,
        reply: oneshot::Sender<AttachResult>,
    },
    /// A socket disconnected (or failed to write); drop it from the fan-out
    /// and presence registries.
    DetachSocket { conn_id: ConnectionId },
    /// SYNC binary frame payload (an encoded `yrs` update).
    ApplySync {
        conn_id: ConnectionId,
        identity: Identity,
        bytes: Vec<u8>,
    },
    /// Decoded AWARENESS frame payload.
    ApplyAwareness {
        conn_id: ConnectionId,
        changes: Vec<PresenceChange>,
    },
    /// Chat text frame; broadcast to every attached socket, including the
    /// sender.
    Chat {
        conn_id: ConnectionId,
        identity: Identity,
        text: String,
    },
    /// Resolve `perms[userId] ?? tokenRole` for a REST caller.
    EffectiveRole {
        user_id: String,
        token_role: Role,
        reply: oneshot::Sender<Role>,
    },
    /// `POST /api/projects/:id/permissions`.
    SetPermission {
        caller_role: Role,
        user_id: String,
        role: Role,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    /// `POST /api/projects/:id/suggestions/:sid/approve`.
    ApproveSuggestion {
        caller_role: Role,
        suggestion_id: String,
        approver_user_id: String,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    /// Part of shutdown: cancel the debounce timer, force one last flush,
    /// and reply once it lands (or immediately if there was nothing dirty).
    Drain { reply: oneshot::Sender<()> },
    /// Part of shutdown, sent after every room has drained: close every
    /// attached socket with code 1012.
    CloseSockets,
    /// Internal: the background persist task finished. Never sent by
    /// anything outside the Room itself.
    FlushCompleted { ok: bool },
}
