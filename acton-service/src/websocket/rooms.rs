//! Room, its persist scheduler, and the Room
//! Registry.
//!
//! Both are hand-rolled `tokio::task` + `mpsc` actors rather than agents
//! built on an async message-reply framework: the Room needs a `yrs`
//! update observer that fires synchronously mid-transaction and a registry
//! that must guarantee a single in-flight creation per id, neither of which
//! map cleanly onto an async agent's message-reply model.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::{mpsc, oneshot, Mutex, OnceCell};
use tokio::time::Instant;

use crate::auth::login::Identity;
use crate::crdt::{presence, CrdtDoc, Presence, SYSTEM_ORIGIN};
use crate::error::Error;
use crate::persistence::PersistenceGateway;
use crate::role::Role;

use super::broadcast::SocketRegistry;
use super::handler::ConnectionId;
use super::messages::{AttachResult, RoomCommand};

static ROOM_ID_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").unwrap());

/// Validated room identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomId(Arc<str>);

impl RoomId {
    pub fn parse(raw: &str) -> Result<Self, InvalidRoomId> {
        if ROOM_ID_PATTERN.is_match(raw) {
            Ok(Self(Arc::from(raw)))
        } else {
            Err(InvalidRoomId)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("room id must match [A-Za-z0-9_-]{{1,64}}")]
pub struct InvalidRoomId;

const INITIAL_DEBOUNCE: Duration = Duration::from_millis(1200);
const RETRY_DEBOUNCE: Duration = Duration::from_millis(600);

fn framed(tag: u8, payload: &[u8]) -> Message {
    let mut buf = Vec::with_capacity(payload.len() + 1);
    buf.push(tag);
    buf.extend_from_slice(payload);
    Message::Binary(buf.into())
}

/// Cloneable handle to a running Room actor.
#[derive(Clone)]
pub struct RoomHandle {
    tx: mpsc::UnboundedSender<RoomCommand>,
}

impl RoomHandle {
    pub fn send(&self, cmd: RoomCommand) -> Result<(), mpsc::error::SendError<RoomCommand>> {
        self.tx.send(cmd)
    }

    pub fn send_detach(&self, conn_id: ConnectionId) {
        let _ = self.tx.send(RoomCommand::DetachSocket { conn_id });
    }

    /// Close every socket currently attached to this room with code 1012
    ///. Fire-and-forget: the room's own
    /// teardown doesn't wait on socket writers draining.
    pub fn close_sockets(&self) {
        let _ = self.tx.send(RoomCommand::CloseSockets);
    }

    pub async fn effective_role(&self, user_id: String, token_role: Role) -> Role {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(RoomCommand::EffectiveRole {
                user_id,
                token_role,
                reply,
            })
            .is_err()
        {
            return token_role;
        }
        rx.await.unwrap_or(token_role)
    }

    pub async fn set_permission(
        &self,
        caller_role: Role,
        user_id: String,
        role: Role,
    ) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RoomCommand::SetPermission {
                caller_role,
                user_id,
                role,
                reply,
            })
            .map_err(|_| Error::ServiceUnavailable("room is shutting down".into()))?;
        rx.await
            .map_err(|_| Error::ServiceUnavailable("room is shutting down".into()))?
    }

    pub async fn approve_suggestion(
        &self,
        caller_role: Role,
        suggestion_id: String,
        approver_user_id: String,
    ) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RoomCommand::ApproveSuggestion {
                caller_role,
                suggestion_id,
                approver_user_id,
                reply,
            })
            .map_err(|_| Error::ServiceUnavailable("room is shutting down".into()))?;
        rx.await
            .map_err(|_| Error::ServiceUnavailable("room is shutting down".into()))?
    }

    /// Cancel the debounce timer and force one last flush, awaiting it.
    /// Used both at server shutdown and (indirectly) when a room empties.
    pub async fn drain(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(RoomCommand::Drain { reply }).is_ok() {
            let _ = rx.await;
        }
    }
}

struct RoomActor {
    id: RoomId,
    doc: CrdtDoc,
    presence: Presence,
    sockets: SocketRegistry,
    socket_client_ids: HashMap<ConnectionId, HashSet<u32>>,
    perms: HashMap<String, Role>,
    persistence: Arc<PersistenceGateway>,
    registry: RoomRegistryHandle,
    self_tx: mpsc::UnboundedSender<RoomCommand>,
    persist_deadline: Option<Instant>,
    persist_task: Option<tokio::task::JoinHandle<bool>>,
    persist_requested: bool,
    _doc_subscription: yrs::Subscription,
}

impl RoomActor {
    /// Returns `true` when the room should stop (its last socket left and
    /// its final flush has landed).
    async fn handle(&mut self, cmd: RoomCommand) -> bool {
        match cmd {
            RoomCommand::AttachSocket {
                conn_id,
                sender,
                reply,
                ..
            } => {
                self.sockets.register(conn_id, sender);
                let result = AttachResult {
                    sync_snapshot: self.doc.encode_state_as_update(),
                    awareness_snapshot: self.presence.encode_full(),
                };
                let _ = reply.send(result);
                false
            }
            RoomCommand::DetachSocket { conn_id } => {
                self.sockets.unregister(conn_id);
                if let Some(client_ids) = self.socket_client_ids.remove(&conn_id) {
                    if !client_ids.is_empty() {
                        let ids: Vec<u32> = client_ids.into_iter().collect();
                        let removed = self.presence.remove(&ids);
                        if !removed.is_empty() {
                            self.sockets
                                .broadcast_all(framed(1, &presence::encode(&removed)));
                        }
                    }
                }
                if self.sockets.is_empty() {
                    self.shut_down().await;
                    return true;
                }
                false
            }
            RoomCommand::ApplySync {
                conn_id,
                identity,
                bytes,
            } => {
                let effective = self
                    .perms
                    .get(&identity.user_id)
                    .copied()
                    .unwrap_or(identity.role);
                if !effective.at_least(Role::Editor) {
                    let payload = serde_json::json!({
                        "type": "error",
                        "message": "insufficient permissions for editing",
                    });
                    self.sockets
                        .send_to(conn_id, Message::Text(payload.to_string().into()));
                    return false;
                }
                if let Err(err) = self
                    .doc
                    .apply_update_with_origin(&bytes, conn_id.as_origin_tag())
                {
                    tracing::debug!(room = %self.id, conn = %conn_id, error = %err, "dropping malformed sync update");
                } else {
                    self.schedule_flush();
                }
                false
            }
            RoomCommand::ApplyAwareness { conn_id, changes } => {
                let applied = self.presence.apply(&changes);
                if !applied.is_empty() {
                    let entry = self.socket_client_ids.entry(conn_id).or_default();
                    entry.extend(applied.iter().map(|c| c.client_id));
                    self.sockets.broadcast_except(
                        Some(conn_id),
                        framed(1, &presence::encode(&applied)),
                    );
                }
                false
            }
            RoomCommand::Chat {
                identity, text, ..
            } => {
                let payload = serde_json::json!({
                    "type": "chat",
                    "id": uuid::Uuid::new_v4().to_string(),
                    "userId": identity.user_id,
                    "username": identity.username,
                    "text": text,
                    "sentAt": chrono::Utc::now().to_rfc3339(),
                });
                self.sockets
                    .broadcast_all(Message::Text(payload.to_string().into()));
                false
            }
            RoomCommand::EffectiveRole {
                user_id,
                token_role,
                reply,
            } => {
                let role = self.perms.get(&user_id).copied().unwrap_or(token_role);
                let _ = reply.send(role);
                false
            }
            RoomCommand::SetPermission {
                caller_role,
                user_id,
                role,
                reply,
            } => {
                let _ = reply.send(self.set_permission(caller_role, user_id, role).await);
                false
            }
            RoomCommand::ApproveSuggestion {
                caller_role,
                suggestion_id,
                approver_user_id,
                reply,
            } => {
                let _ = reply.send(self.approve_suggestion(
                    caller_role,
                    suggestion_id,
                    approver_user_id,
                ));
                false
            }
            RoomCommand::FlushCompleted { ok } => {
                self.persist_task = None;
                if !ok {
                    tracing::warn!(room = %self.id, "persist flush failed");
                }
                if self.persist_requested {
                    self.persist_requested = false;
                    self.persist_deadline = Some(Instant::now() + RETRY_DEBOUNCE);
                }
                false
            }
            RoomCommand::Drain { reply } => {
                self.drain_and_reply(reply).await;
                false
            }
            RoomCommand::CloseSockets => {
                self.sockets.broadcast_all(Message::Close(Some(CloseFrame {
                    code: 1012,
                    reason: "server is shutting down".into(),
                })));
                false
            }
        }
    }

    async fn set_permission(
        &mut self,
        caller_role: Role,
        user_id: String,
        role: Role,
    ) -> Result<(), Error> {
        if !caller_role.at_least(Role::Admin) {
            return Err(Error::Forbidden(
                "admin role required to change permissions".into(),
            ));
        }
        self.perms.insert(user_id.clone(), role);
        self.persistence
            .set_project_permission(self.id.as_str(), &user_id, role)
            .await
            .map_err(|err| Error::Internal(format!("failed to persist permission: {err}")))
    }

    fn approve_suggestion(
        &mut self,
        caller_role: Role,
        suggestion_id: String,
        approver_user_id: String,
    ) -> Result<(), Error> {
        if !caller_role.at_least(Role::Admin) {
            return Err(Error::Forbidden(
                "admin role required to approve suggestions".into(),
            ));
        }
        let doc = self.doc.clone();
        let found = self.doc.with_transaction(SYSTEM_ORIGIN, |txn| {
            let suggestions = doc.suggestions();
            match suggestions.get(txn, &suggestion_id) {
                Some(yrs::Value::YMap(map)) => {
                    map.insert(txn, "approved", true);
                    map.insert(txn, "approvedBy", approver_user_id.clone());
                    map.insert(txn, "approvedAt", chrono::Utc::now().to_rfc3339());
                    true
                }
                _ => false,
            }
        });
        if !found {
            return Err(Error::NotFound(format!(
                "suggestion {suggestion_id} not found"
            )));
        }
        self.schedule_flush();
        Ok(())
    }

    fn schedule_flush(&mut self) {
        if self.persist_task.is_some() {
            self.persist_requested = true;
            return;
        }
        if self.persist_deadline.is_none() {
            self.persist_deadline = Some(Instant::now() + INITIAL_DEBOUNCE);
        }
    }

    fn fire_flush(&mut self) {
        self.persist_deadline = None;
        let persistence = self.persistence.clone();
        let doc = self.doc.clone();
        let room_id = self.id.clone();
        let tx = self.self_tx.clone();
        self.persist_task = Some(tokio::spawn(async move {
            let ok = persistence
                .persist_project_state(room_id.as_str(), &doc)
                .await
                .is_ok();
            let _ = tx.send(RoomCommand::FlushCompleted { ok });
            ok
        }));
    }

    /// Cancel the debounce, wait out any flush already in flight (I6: at
    /// most one `persist_project_state` call per room at a time), then run
    /// one more flush directly so the caller observes its result.
    async fn final_flush(&mut self) {
        self.persist_deadline = None;
        self.persist_requested = false;
        if let Some(handle) = self.persist_task.take() {
            let _ = handle.await;
        }
        let _ = self
            .persistence
            .persist_project_state(self.id.as_str(), &self.doc)
            .await;
    }

    /// Cancel the debounce, drain any in-flight flush, then force one final
    /// synchronous flush, replying only once it lands.
    async fn drain_and_reply(&mut self, reply: oneshot::Sender<()>) {
        self.final_flush().await;
        let _ = reply.send(());
    }

    /// Final teardown when the last socket disconnects: cancel the timer,
    /// force a last flush, then tell the registry to forget this room so
    /// the next `get_or_create` spins up a fresh one.
    async fn shut_down(&mut self) {
        self.final_flush().await;
        self.registry.remove(&self.id).await;
    }
}

async fn run(mut actor: RoomActor, mut rx: mpsc::UnboundedReceiver<RoomCommand>) {
    loop {
        let timer = async {
            match actor.persist_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            cmd = rx.recv() => {
                match cmd {
                    Some(cmd) => {
                        if actor.handle(cmd).await {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = timer, if actor.persist_deadline.is_some() => {
                actor.fire_flush();
            }
        }
    }
}

/// Spawn a Room actor for an already-loaded doc/permission set. Only called
/// from `RoomRegistryHandle::get_or_create`.
fn spawn(
    id: RoomId,
    persistence: Arc<PersistenceGateway>,
    perms: HashMap<String, Role>,
    doc: CrdtDoc,
    registry: RoomRegistryHandle,
) -> RoomHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let sockets = SocketRegistry::new();

    let observer_sockets = sockets.clone();
    let subscription = doc.observe_update(move |origin, bytes| {
        let exclude = origin
            .filter(|o| *o != SYSTEM_ORIGIN)
            .map(|o| ConnectionId::from_origin_tag(o.tag()));
        observer_sockets.broadcast_except(exclude, framed(0, &bytes));
    });

    let actor = RoomActor {
        id,
        doc,
        presence: Presence::new(),
        sockets,
        socket_client_ids: HashMap::new(),
        perms,
        persistence,
        registry,
        self_tx: tx.clone(),
        persist_deadline: None,
        persist_task: None,
        persist_requested: false,
        _doc_subscription: subscription,
    };

    tokio::spawn(run(actor, rx));
    RoomHandle { tx }
}

struct RoomSlot {
    cell: OnceCell<RoomHandle>,
}

struct RoomRegistry {
    rooms: Mutex<HashMap<RoomId, Arc<RoomSlot>>>,
    persistence: Arc<PersistenceGateway>,
}

/// Guarantees at most one live Room per id (invariant I1): concurrent
/// `get_or_create` calls for the same id share a single `OnceCell`, so only
/// one of them actually loads persisted state and spawns the actor — the
/// rest simply await that same initialization.
#[derive(Clone)]
pub struct RoomRegistryHandle(Arc<RoomRegistry>);

impl RoomRegistryHandle {
    pub fn new(persistence: Arc<PersistenceGateway>) -> Self {
        Self(Arc::new(RoomRegistry {
            rooms: Mutex::new(HashMap::new()),
            persistence,
        }))
    }

    pub async fn get_or_create(&self, id: RoomId) -> Result<RoomHandle, Error> {
        let slot = {
            let mut rooms = self.0.rooms.lock().await;
            rooms
                .entry(id.clone())
                .or_insert_with(|| {
                    Arc::new(RoomSlot {
                        cell: OnceCell::new(),
                    })
                })
                .clone()
        };

        let handle = slot
            .cell
            .get_or_init(|| async {
                let doc = CrdtDoc::new();
                let perms = self.0.persistence.load_project_state(id.as_str(), &doc).await;
                spawn(id.clone(), self.0.persistence.clone(), perms, doc, self.clone())
            })
            .await;
        Ok(handle.clone())
    }

    /// Drop a torn-down room's slot so the next `get_or_create` spawns a
    /// fresh one instead of reusing a handle whose actor has exited.
    async fn remove(&self, id: &RoomId) {
        self.0.rooms.lock().await.remove(id);
    }

    /// Drain every live room: used during the server shutdown sequence
    /// before closing sockets and the HTTP/WS listeners.
    pub async fn drain_all(&self) {
        let handles: Vec<RoomHandle> = {
            let rooms = self.0.rooms.lock().await;
            rooms
                .values()
                .filter_map(|slot| slot.cell.get().cloned())
                .collect()
        };
        for handle in handles {
            handle.drain().await;
        }
    }

    /// Close every socket in every live room with code 1012. Called after
    /// `drain_all` during the shutdown sequence, before the HTTP/WS
    /// listener stops accepting connections.
    pub async fn close_all_sockets(&self) {
        let handles: Vec<RoomHandle> = {
            let rooms = self.0.rooms.lock().await;
            rooms
                .values()
                .filter_map(|slot| slot.cell.get().cloned())
                .collect()
        };
        for handle in handles {
            handle.close_sockets();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_id_accepts_valid_identifiers() {
        assert!(RoomId::parse("project-1").is_ok());
        assert!(RoomId::parse("Proj_42").is_ok());
    }

    #[test]
    fn room_id_rejects_invalid_identifiers() {
        assert!(RoomId::parse("").is_err());
        assert!(RoomId::parse("has a space").is_err());
        assert!(RoomId::parse(&"x".repeat(65)).is_err());
    }

    #[tokio::test]
    async fn registry_returns_the_same_room_for_concurrent_creates() {
        let registry = RoomRegistryHandle::new(Arc::new(PersistenceGateway::disabled()));
        let id = RoomId::parse("room-1").unwrap();

        let a = registry.clone();
        let b = registry.clone();
        let id_a = id.clone();
        let id_b = id.clone();
        let (room_a, room_b) = tokio::join!(
            async move { a.get_or_create(id_a).await.unwrap() },
            async move { b.get_or_create(id_b).await.unwrap() },
        );

        assert!(room_a.send(RoomCommand::DetachSocket {
            conn_id: ConnectionId::next()
        }).is_ok());
        assert!(room_b.send(RoomCommand::DetachSocket {
            conn_id: ConnectionId::next()
        }).is_ok());
    }

    #[tokio::test]
    async fn viewer_sync_update_is_rejected_with_an_error_frame() {
        let registry = RoomRegistryHandle::new(Arc::new(PersistenceGateway::disabled()));
        let room = registry
            .get_or_create(RoomId::parse("room-viewer").unwrap())
            .await
            .unwrap();

        let conn_id = ConnectionId::next();
        let (sender, mut socket_rx) = mpsc::unbounded_channel();
        let (reply, rx) = oneshot::channel();
        room.send(RoomCommand::AttachSocket {
            conn_id,
            identity: Identity {
                user_id: "user:viewer".into(),
                username: "viewer".into(),
                role: Role::Viewer,
            },
            sender,
            reply,
        })
        .unwrap();
        rx.await.unwrap();

        room.send(RoomCommand::ApplySync {
            conn_id,
            identity: Identity {
                user_id: "user:viewer".into(),
                username: "viewer".into(),
                role: Role::Viewer,
            },
            bytes: crate::crdt::CrdtDoc::new().encode_state_as_update(),
        })
        .unwrap();

        let message = socket_rx.recv().await.expect("error frame sent");
        let Message::Text(text) = message else {
            panic!("expected a text frame");
        };
        assert!(text.contains("insufficient permissions"));
    }
}
