use std::collections::HashMap;
use std::fmt;

use chorus_models::user::Identity;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticated,
    /// Joined to a primary room.
    Joined(String),
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Authenticated => f.write_str("authenticated"),
            ConnectionState::Joined(room) => write!(f, "joined({room})"),
            ConnectionState::Disconnected => f.write_str("disconnected"),
        }
    }
}

/// Pending auto-stop timers for typing indicators, one per room.
/// Timers are aborted when replaced, cancelled, or when this is dropped.
#[derive(Default)]
pub struct TypingTimers {
    timers: HashMap<String, JoinHandle<()>>,
}

impl TypingTimers {
    pub fn start(&mut self, room_id: &str, timer: JoinHandle<()>) {
        if let Some(previous) = self.timers.insert(room_id.to_string(), timer) {
            previous.abort();
        }
    }

    pub fn cancel(&mut self, room_id: &str) -> bool {
        match self.timers.remove(room_id) {
            Some(timer) => {
                timer.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) -> usize {
        let count = self.timers.len();
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        count
    }

    /// Rooms with a timer, pending or already fired.
    pub fn rooms(&self) -> Vec<String> {
        self.timers.keys().cloned().collect()
    }

    pub fn is_pending(&self, room_id: &str) -> bool {
        self.timers
            .get(room_id)
            .is_some_and(|timer| !timer.is_finished())
    }
}

impl Drop for TypingTimers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

/// Per-connection state owned by the connection's task.
pub struct Session {
    pub connection_id: String,
    /// Cluster-wide handle, `node:connection`.
    pub handle: String,
    pub identity: Identity,
    pub address: String,
    pub state: ConnectionState,
    pub connected_at: DateTime<Utc>,
    pub typing: TypingTimers,
}

impl Session {
    pub fn new(connection_id: String, handle: String, identity: Identity, address: String) -> Self {
        Self {
            connection_id,
            handle,
            identity,
            address,
            state: ConnectionState::Connecting,
            connected_at: Utc::now(),
            typing: TypingTimers::default(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.identity.user_id
    }

    pub fn primary_room(&self) -> Option<&str> {
        match &self.state {
            ConnectionState::Joined(room) => Some(room.as_str()),
            _ => None,
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.state == ConnectionState::Disconnected
    }
}
