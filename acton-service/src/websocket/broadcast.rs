//! Socket fan-out for a single Room.
//!
//! A generic fan-out registry (`Arc<Mutex<HashMap<ConnectionId, Sender>>>`)
//! would normally reach for an async `RwLock` and a bounded channel, but the
//! CRDT doc's update observer fires synchronously while a transaction
//! commits, so this registry uses a blocking `Mutex` and
//! `UnboundedSender::send` (itself synchronous) — an async lock would
//! require an executor to `.await` from inside a non-async callback.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::ws::Message;
use tokio::sync::mpsc;

use super::handler::ConnectionId;

/// Registry of sockets currently attached to one Room, keyed by connection
/// id. Cloning is cheap (an `Arc` around the shared map); the Room actor and
/// the doc/presence update observers it registers all hold a clone.
#[derive(Clone, Default)]
pub struct SocketRegistry {
    sockets: Arc<Mutex<HashMap<ConnectionId, mpsc::UnboundedSender<Message>>>>,
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: ConnectionId, sender: mpsc::UnboundedSender<Message>) {
        self.sockets.lock().unwrap().insert(id, sender);
    }

    pub fn unregister(&self, id: ConnectionId) {
        self.sockets.lock().unwrap().remove(&id);
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.sockets.lock().unwrap().len()
    }

    /// Send to a single socket. Silently drops the message if the socket's
    /// writer task has already gone away (fire-and-forget, —
    /// "awaiting socket send completion is not required").
    pub fn send_to(&self, id: ConnectionId, message: Message) {
        if let Some(sender) = self.sockets.lock().unwrap().get(&id) {
            let _ = sender.send(message);
        }
    }

    /// Broadcast to every socket except `origin` (`None` excludes nothing —
    /// used for server-local mutations with no originating socket, and for
    /// chat, which broadcasts to the sender too).
    pub fn broadcast_except(&self, origin: Option<ConnectionId>, message: Message) {
        let sockets = self.sockets.lock().unwrap();
        for (id, sender) in sockets.iter() {
            if Some(*id) == origin {
                continue;
            }
            let _ = sender.send(message.clone());
        }
    }

    pub fn broadcast_all(&self, message: Message) {
        self.broadcast_except(None, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_except_skips_origin() {
        let registry = SocketRegistry::new();
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        registry.register(a, tx_a);
        registry.register(b, tx_b);

        registry.broadcast_except(Some(a), Message::Text("hi".into()));

        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn unregister_removes_socket() {
        let registry = SocketRegistry::new();
        let a = ConnectionId::next();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.register(a, tx);
        assert_eq!(registry.len(), 1);
        registry.unregister(a);
        assert!(registry.is_empty());
    }
}
