use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chorus_models::gateway::ServerEvent;
use chorus_store::{RecvError, Subscription};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::events::{Envelope, EventBus, Target};
use crate::rooms::RoomCoordinator;

pub type EventReceiver = mpsc::Receiver<Arc<ServerEvent>>;
type EventSender = mpsc::Sender<Arc<ServerEvent>>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("server connection limit reached")]
    ServerFull,
    #[error("too many connections for this user")]
    UserLimit,
}

struct LocalConnection {
    handle: String,
    user_id: String,
    room: Option<String>,
    tx: EventSender,
}

/// Live connections attached to this node. Connections are keyed by their
/// local id; the cluster-wide handle is `node:id`.
pub struct ConnectionRegistry {
    node_id: String,
    connections: DashMap<String, LocalConnection>,
    per_user: DashMap<String, usize>,
    active: AtomicUsize,
    max_connections: usize,
    max_per_user: usize,
    buffer: usize,
}

impl ConnectionRegistry {
    pub fn new(node_id: impl Into<String>, max_connections: usize, max_per_user: usize, buffer: usize) -> Self {
        Self {
            node_id: node_id.into(),
            connections: DashMap::new(),
            per_user: DashMap::new(),
            active: AtomicUsize::new(0),
            max_connections: max_connections.max(1),
            max_per_user: max_per_user.max(1),
            buffer: buffer.max(1),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn handle_for(&self, connection_id: &str) -> String {
        format!("{}:{}", self.node_id, connection_id)
    }

    pub fn try_register(&self, connection_id: &str, user_id: &str) -> Result<EventReceiver, AdmissionError> {
        loop {
            let current = self.active.load(Ordering::Acquire);
            if current >= self.max_connections {
                return Err(AdmissionError::ServerFull);
            }
            if self
                .active
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        {
            let mut count = self.per_user.entry(user_id.to_string()).or_insert(0);
            if *count >= self.max_per_user {
                drop(count);
                self.active.fetch_sub(1, Ordering::AcqRel);
                return Err(AdmissionError::UserLimit);
            }
            *count += 1;
        }

        let (tx, rx) = mpsc::channel(self.buffer);
        self.connections.insert(
            connection_id.to_string(),
            LocalConnection {
                handle: self.handle_for(connection_id),
                user_id: user_id.to_string(),
                room: None,
                tx,
            },
        );
        Ok(rx)
    }

    /// Idempotent. Dropping the sender ends the connection's event stream.
    pub fn unregister(&self, connection_id: &str) -> bool {
        let Some((_, conn)) = self.connections.remove(connection_id) else {
            return false;
        };
        self.active.fetch_sub(1, Ordering::AcqRel);
        if let Some(mut count) = self.per_user.get_mut(&conn.user_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                drop(count);
                self.per_user.remove_if(&conn.user_id, |_, c| *c == 0);
            }
        }
        true
    }

    pub fn set_room(&self, connection_id: &str, room_id: Option<String>) {
        if let Some(mut conn) = self.connections.get_mut(connection_id) {
            conn.room = room_id;
        }
    }

    pub fn room_of(&self, connection_id: &str) -> Option<String> {
        self.connections
            .get(connection_id)
            .and_then(|conn| conn.room.clone())
    }

    /// Detach every local connection from a room that no longer exists.
    pub fn clear_room(&self, room_id: &str) {
        for mut conn in self.connections.iter_mut() {
            if conn.room.as_deref() == Some(room_id) {
                conn.room = None;
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn user_connection_count(&self, user_id: &str) -> usize {
        self.per_user.get(user_id).map(|c| *c).unwrap_or(0)
    }

    /// Hand an event to every matching local connection. A connection whose
    /// buffer is full is evicted; its handler sees the stream end and closes.
    pub fn deliver(&self, envelope: &Envelope) -> usize {
        let event = Arc::new(envelope.event.clone());
        let mut delivered = 0;
        let mut evict = Vec::new();

        for entry in self.connections.iter() {
            let conn = entry.value();
            if envelope.exclude.as_deref() == Some(conn.handle.as_str()) {
                continue;
            }
            let matches = match &envelope.target {
                Target::All => true,
                Target::Room(room_id) => conn.room.as_deref() == Some(room_id.as_str()),
                Target::Users(users) => users.iter().any(|u| *u == conn.user_id),
                Target::Connection(handle) => *handle == conn.handle,
            };
            if !matches {
                continue;
            }
            match conn.tx.try_send(Arc::clone(&event)) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(connection = %conn.handle, "outbound buffer full, evicting connection");
                    evict.push(entry.key().clone());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => evict.push(entry.key().clone()),
            }
        }

        for connection_id in evict {
            self.unregister(&connection_id);
        }
        delivered
    }

    /// Drop every local connection. Used when this node has missed events.
    pub fn evict_all(&self) -> usize {
        let ids: Vec<String> = self.connections.iter().map(|e| e.key().clone()).collect();
        let count = ids.len();
        for connection_id in ids {
            self.unregister(&connection_id);
        }
        count
    }
}

/// Pump events from the shared channel into local connections until the
/// channel closes. Room deletions also invalidate the local room cache.
pub async fn run_bridge(mut subscription: Subscription, registry: Arc<ConnectionRegistry>, rooms: RoomCoordinator) {
    tracing::info!(channel = subscription.channel(), node = registry.node_id(), "fan-out bridge started");
    loop {
        match subscription.recv().await {
            Ok(payload) => {
                let envelope = match EventBus::decode(&payload) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        tracing::warn!(error = %err, "dropping undecodable event");
                        continue;
                    }
                };
                if let ServerEvent::RoomDeleted(deleted) = &envelope.event {
                    rooms.invalidate(&deleted.room_id).await;
                    registry.clear_room(&deleted.room_id);
                }
                let delivered = registry.deliver(&envelope);
                tracing::trace!(event = envelope.event.name(), origin = %envelope.origin, delivered, "fan-out");
            }
            Err(RecvError::Lagged(skipped)) => {
                let evicted = registry.evict_all();
                tracing::warn!(skipped, evicted, "fan-out bridge lagged, dropped local connections");
            }
            Err(RecvError::Closed) => {
                tracing::warn!("event channel closed, fan-out bridge stopping");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_models::gateway::RoomLeft;

    fn event() -> ServerEvent {
        ServerEvent::RoomLeft(RoomLeft {
            room_id: "lobby".into(),
        })
    }

    fn envelope(target: Target, exclude: Option<&str>) -> Envelope {
        Envelope {
            origin: "n1".into(),
            target,
            exclude: exclude.map(str::to_string),
            event: event(),
        }
    }

    #[test]
    fn admission_caps_are_enforced() {
        let registry = ConnectionRegistry::new("n1", 3, 2, 8);
        let _a = registry.try_register("c1", "alice").unwrap();
        let _b = registry.try_register("c2", "alice").unwrap();
        assert_eq!(registry.try_register("c3", "alice").unwrap_err(), AdmissionError::UserLimit);
        let _c = registry.try_register("c3", "bob").unwrap();
        assert_eq!(registry.try_register("c4", "carol").unwrap_err(), AdmissionError::ServerFull);

        assert!(registry.unregister("c1"));
        assert!(!registry.unregister("c1"));
        assert_eq!(registry.connection_count(), 2);
        assert_eq!(registry.user_connection_count("alice"), 1);
        assert!(registry.try_register("c4", "carol").is_ok());
    }

    #[tokio::test]
    async fn room_target_reaches_only_room_members() {
        let registry = ConnectionRegistry::new("n1", 10, 10, 8);
        let mut in_room = registry.try_register("c1", "alice").unwrap();
        let mut elsewhere = registry.try_register("c2", "bob").unwrap();
        let mut sender = registry.try_register("c3", "carol").unwrap();
        registry.set_room("c1", Some("lobby".into()));
        registry.set_room("c2", Some("other".into()));
        registry.set_room("c3", Some("lobby".into()));

        let delivered = registry.deliver(&envelope(Target::Room("lobby".into()), Some("n1:c3")));
        assert_eq!(delivered, 1);
        assert_eq!(*in_room.recv().await.unwrap(), event());
        assert!(elsewhere.try_recv().is_err());
        assert!(sender.try_recv().is_err());
    }

    #[tokio::test]
    async fn connection_and_user_targets() {
        let registry = ConnectionRegistry::new("n1", 10, 10, 8);
        let mut a1 = registry.try_register("c1", "alice").unwrap();
        let mut a2 = registry.try_register("c2", "alice").unwrap();

        assert_eq!(registry.deliver(&envelope(Target::Connection("n1:c2".into()), None)), 1);
        assert!(a1.try_recv().is_err());
        assert!(a2.try_recv().is_ok());

        assert_eq!(registry.deliver(&envelope(Target::Users(vec!["alice".into()]), None)), 2);
        assert_eq!(registry.deliver(&envelope(Target::Connection("n2:c1".into()), None)), 0);
    }

    #[tokio::test]
    async fn slow_consumer_is_evicted() {
        let registry = ConnectionRegistry::new("n1", 10, 10, 2);
        let mut slow = registry.try_register("c1", "alice").unwrap();
        for _ in 0..3 {
            registry.deliver(&envelope(Target::All, None));
        }
        assert_eq!(registry.connection_count(), 0);
        assert!(slow.recv().await.is_some());
        assert!(slow.recv().await.is_some());
        assert!(slow.recv().await.is_none());
    }

    #[test]
    fn deleted_room_is_cleared_from_connections() {
        let registry = ConnectionRegistry::new("n1", 10, 10, 8);
        let _a = registry.try_register("c1", "alice").unwrap();
        let _b = registry.try_register("c2", "alice").unwrap();
        registry.set_room("c1", Some("lobby".into()));
        registry.set_room("c2", Some("lobby".into()));
        registry.clear_room("lobby");
        assert_eq!(registry.room_of("c1"), None);
        assert_eq!(registry.room_of("c2"), None);
    }
}
