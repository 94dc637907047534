pub mod auth;
pub mod error;
pub mod events;
pub mod fanout;
pub mod guest;
pub mod keys;
pub mod lifecycle;
pub mod presence;
pub mod rate_limit;
pub mod rooms;
pub mod session;
pub mod spam;

use std::sync::Arc;
use std::time::Duration;

use chorus_models::gateway::MemberEvent;
use chorus_models::room::{RoomConfig, DEFAULT_ROOM_CAPACITY};
use chorus_store::SharedStore;
use chorus_util::validation::DEFAULT_MAX_MESSAGE_CHARS;
use tokio::task::JoinHandle;

use crate::auth::Authenticator;
use crate::error::CoreError;
use crate::events::EventBus;
use crate::fanout::ConnectionRegistry;
use crate::guest::GuestRegistry;
use crate::presence::PresenceManager;
use crate::rate_limit::{RateBudgets, RateLimiter};
use crate::rooms::RoomCoordinator;
use crate::spam::{SpamDetector, SpamThresholds};

/// A default room created at startup and exempt from deletion and cleanup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DefaultRoom {
    pub id: String,
    pub name: String,
    pub description: String,
}

impl DefaultRoom {
    pub fn new(id: impl Into<String>, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Unique per process; part of every connection handle.
    pub node_id: String,
    /// Snowflake worker id, 0..1024.
    pub worker_id: u16,
    pub budgets: RateBudgets,
    pub spam: SpamThresholds,
    pub max_message_chars: usize,
    /// Messages returned with `room-joined`.
    pub join_history: usize,
    pub default_room_capacity: u32,
    pub default_rooms: Vec<DefaultRoom>,
    pub presence_ttl: Duration,
    pub heartbeat_interval: Duration,
    /// Connections with no client traffic for this long are closed.
    pub heartbeat_timeout: Duration,
    pub typing_timeout: Duration,
    pub guests_enabled: bool,
    pub guest_idle: Duration,
    pub event_channel: String,
    pub max_connections: usize,
    pub max_connections_per_user: usize,
    /// Outbound events buffered per connection before it is evicted.
    pub outbound_buffer: usize,
    /// Inbound frames accepted per connection per minute.
    pub frames_per_minute: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            worker_id: 1,
            budgets: RateBudgets::default(),
            spam: SpamThresholds::default(),
            max_message_chars: DEFAULT_MAX_MESSAGE_CHARS,
            join_history: 50,
            default_room_capacity: DEFAULT_ROOM_CAPACITY,
            default_rooms: vec![
                DefaultRoom::new("general", "General", "General discussion"),
                DefaultRoom::new("random", "Random", "Off-topic chatter"),
            ],
            presence_ttl: Duration::from_secs(120),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            typing_timeout: Duration::from_secs(3),
            guests_enabled: true,
            guest_idle: Duration::from_secs(24 * 3600),
            event_channel: "chorus:events".to_string(),
            max_connections: 10_000,
            max_connections_per_user: 5,
            outbound_buffer: 256,
            frames_per_minute: 240,
        }
    }
}

impl AppConfig {
    /// Typing state in the store outlives the local timer so a crashed node
    /// cannot leave a user typing forever.
    pub fn typing_state_ttl(&self) -> Duration {
        self.typing_timeout * 3
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn SharedStore>,
    pub events: EventBus,
    pub rooms: RoomCoordinator,
    pub presence: PresenceManager,
    pub limiter: RateLimiter,
    pub spam: SpamDetector,
    pub guests: GuestRegistry,
    /// Connections attached to this process.
    pub registry: Arc<ConnectionRegistry>,
    pub authenticator: Arc<dyn Authenticator>,
}

impl AppState {
    pub fn new(config: AppConfig, store: Arc<dyn SharedStore>, authenticator: Arc<dyn Authenticator>) -> Self {
        let config = Arc::new(config);
        Self {
            events: EventBus::new(Arc::clone(&store), config.event_channel.clone(), config.node_id.clone()),
            rooms: RoomCoordinator::new(Arc::clone(&store), config.worker_id),
            presence: PresenceManager::new(Arc::clone(&store), config.presence_ttl),
            limiter: RateLimiter::new(Arc::clone(&store), config.budgets),
            spam: SpamDetector::new(Arc::clone(&store), config.spam),
            guests: GuestRegistry::new(Arc::clone(&store), config.guest_idle),
            registry: Arc::new(ConnectionRegistry::new(
                config.node_id.clone(),
                config.max_connections,
                config.max_connections_per_user,
                config.outbound_buffer,
            )),
            authenticator,
            store,
            config,
        }
    }

    /// Subscribe to the shared event channel and start delivering to local
    /// connections. The subscription is live when this returns.
    pub async fn start_fanout(&self) -> Result<JoinHandle<()>, CoreError> {
        let subscription = self.events.subscribe().await?;
        Ok(tokio::spawn(fanout::run_bridge(
            subscription,
            Arc::clone(&self.registry),
            self.rooms.clone(),
        )))
    }

    pub async fn bootstrap_default_rooms(&self) -> Result<usize, CoreError> {
        let mut created = 0;
        for room in &self.config.default_rooms {
            let config = RoomConfig {
                name: room.name.clone(),
                description: room.description.clone(),
                is_private: false,
                password: None,
                capacity: self.config.default_room_capacity,
                is_default: true,
            };
            if self.rooms.ensure_room(&room.id, config).await? {
                created += 1;
            }
        }
        tracing::info!(
            created,
            total = self.config.default_rooms.len(),
            "default rooms ready"
        );
        Ok(created)
    }

    /// One pass of periodic housekeeping. Returns (rooms deleted, guests swept).
    pub async fn run_maintenance(&self, room_idle: Duration) -> Result<(usize, usize), CoreError> {
        let rooms = self.rooms.cleanup_inactive_rooms(room_idle).await?;
        let sweep = self.guests.sweep(&self.rooms).await?;
        for departure in sweep.departures {
            let member = MemberEvent {
                room_id: departure.room_id.clone(),
                user_id: departure.user_id,
                display_name: departure.display_name,
            };
            if let Err(err) = lifecycle::announce_departure(self, &departure.room_id, member).await {
                tracing::warn!(room_id = %departure.room_id, error = %err, "guest departure broadcast failed");
            }
        }
        Ok((rooms, sweep.swept))
    }
}
