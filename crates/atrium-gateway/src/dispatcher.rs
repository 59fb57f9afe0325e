//! Room-keyed publish/subscribe. "Publish" is a synchronous fan-out over
//! the connections currently joined to a room, so event ordering and
//! backpressure stay visible instead of hiding inside a framework emitter.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock, mpsc};
use uuid::Uuid;

use atrium_types::events::GatewayEvent;

/// Manages connection channels and room membership, and fans events out.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Per-connection outbound channels.
    conns: RwLock<HashMap<Uuid, mpsc::UnboundedSender<GatewayEvent>>>,

    /// Room membership: conversation id -> joined connections.
    rooms: RwLock<HashMap<Uuid, HashSet<Uuid>>>,

    /// Per-conversation ordering locks. Held across append-then-publish so
    /// fan-out order always matches store insertion order. Entries are tiny
    /// and live for the process lifetime.
    order_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                conns: RwLock::new(HashMap::new()),
                rooms: RwLock::new(HashMap::new()),
                order_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register a connection. Returns its handle and the outbound receiver.
    pub async fn register(&self) -> (Uuid, mpsc::UnboundedReceiver<GatewayEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.conns.write().await.insert(conn_id, tx);
        (conn_id, rx)
    }

    /// Drop a connection from the channel map and every room. Safe to call
    /// more than once.
    pub async fn unregister(&self, conn_id: Uuid) {
        self.inner.conns.write().await.remove(&conn_id);
        let mut rooms = self.inner.rooms.write().await;
        rooms.retain(|_, members| {
            members.remove(&conn_id);
            !members.is_empty()
        });
    }

    pub async fn join_room(&self, conversation_id: Uuid, conn_id: Uuid) {
        self.inner
            .rooms
            .write()
            .await
            .entry(conversation_id)
            .or_default()
            .insert(conn_id);
    }

    pub async fn leave_room(&self, conversation_id: Uuid, conn_id: Uuid) {
        let mut rooms = self.inner.rooms.write().await;
        if let Some(members) = rooms.get_mut(&conversation_id) {
            members.remove(&conn_id);
            if members.is_empty() {
                rooms.remove(&conversation_id);
            }
        }
    }

    pub async fn is_joined(&self, conversation_id: Uuid, conn_id: Uuid) -> bool {
        self.inner
            .rooms
            .read()
            .await
            .get(&conversation_id)
            .is_some_and(|members| members.contains(&conn_id))
    }

    /// The lock serializing append-then-publish for one conversation.
    pub async fn order_lock(&self, conversation_id: Uuid) -> Arc<Mutex<()>> {
        self.inner
            .order_locks
            .lock()
            .await
            .entry(conversation_id)
            .or_default()
            .clone()
    }

    /// Fan an event out to every connection joined to a room. Sends to
    /// connections that just disconnected are silently dropped; room
    /// traffic is an accepted lossy path for those races.
    pub async fn publish(&self, conversation_id: Uuid, event: GatewayEvent, except: Option<Uuid>) {
        let members: Vec<Uuid> = {
            let rooms = self.inner.rooms.read().await;
            match rooms.get(&conversation_id) {
                Some(members) => members.iter().copied().collect(),
                None => return,
            }
        };

        let conns = self.inner.conns.read().await;
        for conn_id in members {
            if Some(conn_id) == except {
                continue;
            }
            if let Some(tx) = conns.get(&conn_id) {
                let _ = tx.send(event.clone());
            }
        }
    }

    /// Send an event to one connection.
    pub async fn send_to(&self, conn_id: Uuid, event: GatewayEvent) {
        if let Some(tx) = self.inner.conns.read().await.get(&conn_id) {
            let _ = tx.send(event);
        }
    }

    /// Send an event to every connection (presence traffic).
    pub async fn broadcast(&self, event: GatewayEvent, except: Option<Uuid>) {
        let conns = self.inner.conns.read().await;
        for (conn_id, tx) in conns.iter() {
            if Some(*conn_id) == except {
                continue;
            }
            let _ = tx.send(event.clone());
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atrium_types::identity::Identity;

    fn presence_event(identity: &str, online: bool) -> GatewayEvent {
        GatewayEvent::PresenceChanged {
            identity: Identity::new(identity),
            display_name: identity.to_string(),
            online,
        }
    }

    #[tokio::test]
    async fn publish_reaches_only_joined_connections() {
        let dispatcher = Dispatcher::new();
        let room = Uuid::new_v4();

        let (joined, mut joined_rx) = dispatcher.register().await;
        let (_bystander, mut bystander_rx) = dispatcher.register().await;
        dispatcher.join_room(room, joined).await;

        dispatcher
            .publish(room, presence_event("1", true), None)
            .await;

        assert!(joined_rx.recv().await.is_some());
        assert!(bystander_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_preserves_order_per_receiver() {
        let dispatcher = Dispatcher::new();
        let room = Uuid::new_v4();
        let (conn, mut rx) = dispatcher.register().await;
        dispatcher.join_room(room, conn).await;

        dispatcher
            .publish(room, presence_event("first", true), None)
            .await;
        dispatcher
            .publish(room, presence_event("second", true), None)
            .await;

        for expected in ["first", "second"] {
            match rx.recv().await.unwrap() {
                GatewayEvent::PresenceChanged { identity, .. } => {
                    assert_eq!(identity.as_str(), expected)
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn except_skips_the_sender() {
        let dispatcher = Dispatcher::new();
        let room = Uuid::new_v4();
        let (sender, mut sender_rx) = dispatcher.register().await;
        let (other, mut other_rx) = dispatcher.register().await;
        dispatcher.join_room(room, sender).await;
        dispatcher.join_room(room, other).await;

        dispatcher
            .publish(room, presence_event("1", true), Some(sender))
            .await;

        assert!(other_rx.recv().await.is_some());
        assert!(sender_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregister_removes_room_membership() {
        let dispatcher = Dispatcher::new();
        let room = Uuid::new_v4();
        let (conn, _rx) = dispatcher.register().await;
        dispatcher.join_room(room, conn).await;
        assert!(dispatcher.is_joined(room, conn).await);

        dispatcher.unregister(conn).await;
        assert!(!dispatcher.is_joined(room, conn).await);

        // Idempotent.
        dispatcher.unregister(conn).await;
    }
}
