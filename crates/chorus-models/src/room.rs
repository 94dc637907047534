use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MIN_ROOM_CAPACITY: u32 = 2;
pub const MAX_ROOM_CAPACITY: u32 = 1000;
pub const DEFAULT_ROOM_CAPACITY: u32 = 100;

/// Room metadata as held in the shared store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: String,
    pub name: String,
    pub description: String,
    pub is_private: bool,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub capacity: u32,
    pub created_by: String,
    pub message_count: u64,
    pub last_activity: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub is_default: bool,
}

impl Room {
    pub fn summary(&self, member_count: usize) -> RoomSummary {
        RoomSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            is_private: self.is_private,
            capacity: self.capacity,
            member_count,
            message_count: self.message_count,
            last_activity: self.last_activity,
            is_default: self.is_default,
        }
    }
}

/// Requested settings for a new room. The password is plaintext here and
/// hashed before it reaches the store.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub name: String,
    pub description: String,
    pub is_private: bool,
    pub password: Option<String>,
    pub capacity: u32,
    pub is_default: bool,
}

impl RoomConfig {
    pub fn public(name: impl Into<String>, capacity: u32) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            is_private: false,
            password: None,
            capacity,
            is_default: false,
        }
    }

    pub fn private(name: impl Into<String>, password: impl Into<String>, capacity: u32) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            is_private: true,
            password: Some(password.into()),
            capacity,
            is_default: false,
        }
    }
}

/// Client-facing view of a room. Never carries the password hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub is_private: bool,
    pub capacity: u32,
    pub member_count: usize,
    pub message_count: u64,
    pub last_activity: DateTime<Utc>,
    pub is_default: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub user_id: String,
    pub display_name: String,
}

/// Result of a successful join: the room and who is in it right now.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub room: RoomSummary,
    pub members: Vec<Member>,
}
