use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chorus_models::presence::{OnlineUser, PresenceRecord};
use chorus_models::user::{Identity, Role};
use chorus_store::{Fields, SharedStore};
use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::keys;

/// Presence records live only in the shared store, one hash per user with a
/// TTL refreshed by heartbeats. A record names the connection that owns it.
#[derive(Clone)]
pub struct PresenceManager {
    store: Arc<dyn SharedStore>,
    ttl: Duration,
}

impl PresenceManager {
    pub fn new(store: Arc<dyn SharedStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Last writer wins: a newer connection silently supersedes the old one.
    pub async fn set_online(
        &self,
        identity: &Identity,
        connection: &str,
        metadata: serde_json::Value,
    ) -> Result<(), CoreError> {
        let fields: Fields = vec![
            ("user_id".into(), identity.user_id.clone()),
            ("display_name".into(), identity.display_name.clone()),
            ("role".into(), identity.role.as_str().to_string()),
            ("connection".into(), connection.to_string()),
            ("last_seen".into(), Utc::now().to_rfc3339()),
            ("metadata".into(), metadata.to_string()),
        ];
        self.store
            .hash_replace(&keys::presence(&identity.user_id), fields, Some(self.ttl))
            .await?;
        tracing::debug!(user_id = %identity.user_id, connection, "presence online");
        Ok(())
    }

    /// Removes the record only while `connection` still owns it, so a late
    /// disconnect cannot wipe a fresh reconnect. Returns whether it removed.
    pub async fn set_offline(&self, user_id: &str, connection: &str) -> Result<bool, CoreError> {
        let removed = self
            .store
            .delete_if_field_eq(&keys::presence(user_id), "connection", connection)
            .await?;
        if removed {
            tracing::debug!(user_id, connection, "presence offline");
        } else {
            tracing::debug!(user_id, connection, "stale disconnect ignored");
        }
        Ok(removed)
    }

    /// Extend the TTL if `connection` still owns the record.
    pub async fn refresh(&self, user_id: &str, connection: &str) -> Result<bool, CoreError> {
        Ok(self
            .store
            .update_if_field_eq(
                &keys::presence(user_id),
                "connection",
                connection,
                vec![("last_seen".into(), Utc::now().to_rfc3339())],
                Some(self.ttl),
            )
            .await?)
    }

    pub async fn get(&self, user_id: &str) -> Result<Option<PresenceRecord>, CoreError> {
        let fields = self.store.hash_get_all(&keys::presence(user_id)).await?;
        Ok(fields.and_then(|fields| record_from_fields(user_id, &fields)))
    }

    pub async fn resolve_connection(&self, user_id: &str) -> Result<Option<String>, CoreError> {
        Ok(self
            .store
            .hash_get(&keys::presence(user_id), "connection")
            .await?)
    }

    pub async fn is_online(&self, user_id: &str) -> Result<bool, CoreError> {
        Ok(self.store.exists(&keys::presence(user_id)).await?)
    }

    /// Snapshot of everyone with a live record, sorted by display name.
    /// Records that expire mid-scan are skipped.
    pub async fn list_online(&self) -> Result<Vec<OnlineUser>, CoreError> {
        let found = self.store.scan_prefix(keys::PRESENCE_PREFIX).await?;
        let mut users = Vec::with_capacity(found.len());
        for key in found {
            let user_id = &key[keys::PRESENCE_PREFIX.len()..];
            if let Some(record) = self.get(user_id).await? {
                users.push(OnlineUser::from(&record));
            }
        }
        users.sort_by(|a, b| {
            a.display_name
                .to_lowercase()
                .cmp(&b.display_name.to_lowercase())
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        Ok(users)
    }
}

fn record_from_fields(user_id: &str, fields: &HashMap<String, String>) -> Option<PresenceRecord> {
    let last_seen = fields
        .get("last_seen")
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|t| t.with_timezone(&Utc))?;
    Some(PresenceRecord {
        user_id: user_id.to_string(),
        display_name: fields.get("display_name").cloned().unwrap_or_default(),
        role: fields
            .get("role")
            .and_then(|raw| raw.parse::<Role>().ok())
            .unwrap_or(Role::Guest),
        connection: fields.get("connection").cloned()?,
        last_seen,
        metadata: fields
            .get("metadata")
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default(),
    })
}
