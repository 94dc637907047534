use std::sync::Arc;

use chorus_models::gateway::ServerEvent;
use chorus_store::{Publication, SharedStore, Subscription};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Who on the receiving nodes should get an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Target {
    All,
    /// Local connections whose primary room is this one.
    Room(String),
    Users(Vec<String>),
    /// A single connection handle (`node:connection`).
    Connection(String),
}

/// What travels over the shared pub/sub channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub origin: String,
    pub target: Target,
    /// Connection handle that must not receive the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<String>,
    pub event: ServerEvent,
}

/// Publishes events to every node through the shared store.
/// Nothing is delivered locally here; the fan-out bridge on each node,
/// this one included, picks events up from the channel.
#[derive(Clone)]
pub struct EventBus {
    store: Arc<dyn SharedStore>,
    channel: String,
    origin: String,
}

impl EventBus {
    pub fn new(store: Arc<dyn SharedStore>, channel: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            store,
            channel: channel.into(),
            origin: origin.into(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn envelope(&self, target: Target, exclude: Option<&str>, event: ServerEvent) -> Envelope {
        Envelope {
            origin: self.origin.clone(),
            target,
            exclude: exclude.map(str::to_string),
            event,
        }
    }

    /// Encode an envelope for publishing as part of a store append.
    pub fn publication(&self, envelope: &Envelope) -> Result<Publication, CoreError> {
        Ok(Publication {
            channel: self.channel.clone(),
            payload: serde_json::to_string(envelope)?,
        })
    }

    pub async fn publish(&self, envelope: Envelope) -> Result<usize, CoreError> {
        let payload = serde_json::to_string(&envelope)?;
        let receivers = self.store.publish(&self.channel, &payload).await?;
        tracing::debug!(event = envelope.event.name(), receivers, "event published");
        Ok(receivers)
    }

    pub async fn dispatch_to_room(
        &self,
        room_id: &str,
        event: ServerEvent,
        exclude: Option<&str>,
    ) -> Result<usize, CoreError> {
        self.publish(self.envelope(Target::Room(room_id.to_string()), exclude, event))
            .await
    }

    /// Every connection of the given users, optionally minus one handle.
    pub async fn dispatch_to_users(
        &self,
        user_ids: Vec<String>,
        event: ServerEvent,
        exclude: Option<&str>,
    ) -> Result<usize, CoreError> {
        self.publish(self.envelope(Target::Users(user_ids), exclude, event))
            .await
    }

    pub async fn dispatch_to_connection(&self, handle: &str, event: ServerEvent) -> Result<usize, CoreError> {
        self.publish(self.envelope(Target::Connection(handle.to_string()), None, event))
            .await
    }

    pub async fn dispatch_to_all(&self, event: ServerEvent) -> Result<usize, CoreError> {
        self.publish(self.envelope(Target::All, None, event)).await
    }

    pub async fn subscribe(&self) -> Result<Subscription, CoreError> {
        Ok(self.store.subscribe(&self.channel).await?)
    }

    pub fn decode(payload: &str) -> Result<Envelope, CoreError> {
        Ok(serde_json::from_str(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_models::gateway::RoomLeft;
    use chorus_store::MemoryStore;

    #[tokio::test]
    async fn envelopes_survive_the_channel() {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new(store, "chorus:events", "node-a");
        let mut sub = bus.subscribe().await.unwrap();

        let event = ServerEvent::RoomLeft(RoomLeft {
            room_id: "lobby".into(),
        });
        bus.dispatch_to_room("lobby", event.clone(), Some("node-a:1"))
            .await
            .unwrap();

        let envelope = EventBus::decode(&sub.recv().await.unwrap()).unwrap();
        assert_eq!(envelope.origin, "node-a");
        assert_eq!(envelope.target, Target::Room("lobby".into()));
        assert_eq!(envelope.exclude.as_deref(), Some("node-a:1"));
        assert_eq!(envelope.event, event);
    }

    #[test]
    fn broadcast_target_has_no_id() {
        let json = serde_json::to_value(Target::All).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "all"}));
    }
}
