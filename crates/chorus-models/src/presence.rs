use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::user::Role;

/// A user's presence record. Absence of a record means offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: String,
    pub display_name: String,
    pub role: Role,
    /// Handle of the connection currently owning this record.
    #[serde(skip)]
    pub connection: String,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUser {
    pub user_id: String,
    pub display_name: String,
    pub role: Role,
    pub last_seen: DateTime<Utc>,
}

impl From<&PresenceRecord> for OnlineUser {
    fn from(record: &PresenceRecord) -> Self {
        Self {
            user_id: record.user_id.clone(),
            display_name: record.display_name.clone(),
            role: record.role,
            last_seen: record.last_seen,
        }
    }
}
