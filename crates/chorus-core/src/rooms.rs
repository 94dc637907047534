use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chorus_models::message::{HistoryPage, Message, MessageKind};
use chorus_models::room::{
    Member, Room, RoomConfig, RoomSnapshot, RoomSummary, MAX_ROOM_CAPACITY, MIN_ROOM_CAPACITY,
};
use chorus_models::user::{Identity, Role};
use chorus_store::{BoundedInsert, Fields, Publication, SharedStore, StoreError};
use chorus_util::pagination::HistoryParams;
use chorus_util::{snowflake, validation};
use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::{auth, keys};

/// How far back `find_message` looks when authorising a deletion.
const MESSAGE_LOOKUP_WINDOW: usize = 1000;

/// Cached room metadata: 30s TTL, 10k max entries.
pub fn build_room_cache() -> moka::future::Cache<String, Arc<Room>> {
    moka::future::Cache::builder()
        .max_capacity(10_000)
        .time_to_live(Duration::from_secs(30))
        .build()
}

/// A message about to be appended to a room.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub room_id: String,
    pub author_id: String,
    pub author_name: String,
    pub body: String,
    pub kind: MessageKind,
}

/// A membership removed without the member's own connection being involved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub room_id: String,
    pub user_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub snapshot: RoomSnapshot,
    /// False when the user was already a member.
    pub newly_joined: bool,
}

/// Owns room metadata, membership and message history in the shared store.
/// Membership and rate checks on posting are the caller's responsibility.
#[derive(Clone)]
pub struct RoomCoordinator {
    store: Arc<dyn SharedStore>,
    cache: moka::future::Cache<String, Arc<Room>>,
    worker_id: u16,
}

impl RoomCoordinator {
    pub fn new(store: Arc<dyn SharedStore>, worker_id: u16) -> Self {
        Self {
            store,
            cache: build_room_cache(),
            worker_id,
        }
    }

    pub async fn create_room(
        &self,
        room_id: &str,
        config: RoomConfig,
        created_by: &str,
    ) -> Result<Room, CoreError> {
        validation::validate_room_id(room_id)?;
        validation::validate_room_name(&config.name)?;
        validation::validate_room_description(&config.description)?;
        validation::validate_room_password(config.password.as_deref(), config.is_private)?;
        validation::validate_capacity(config.capacity, MIN_ROOM_CAPACITY, MAX_ROOM_CAPACITY)?;

        if self.store.exists(&keys::room(room_id)).await? {
            return Err(CoreError::RoomExists(room_id.to_string()));
        }

        let password_hash = match (config.is_private, config.password) {
            (true, Some(password)) => Some(auth::hash_password_blocking(password).await?),
            _ => None,
        };
        let now = Utc::now();
        let room = Room {
            id: room_id.to_string(),
            name: config.name.trim().to_string(),
            description: config.description,
            is_private: config.is_private,
            password_hash,
            capacity: config.capacity,
            created_by: created_by.to_string(),
            message_count: 0,
            last_activity: now,
            created_at: now,
            is_default: config.is_default,
        };

        if !self
            .store
            .hash_create(&keys::room(room_id), room_fields(&room), None)
            .await?
        {
            return Err(CoreError::RoomExists(room_id.to_string()));
        }
        self.store.set_add(keys::ROOM_INDEX, room_id).await?;
        tracing::info!(room_id, created_by, is_private = room.is_private, "room created");
        Ok(room)
    }

    /// Create the room unless it already exists. Used for default rooms at startup.
    pub async fn ensure_room(&self, room_id: &str, config: RoomConfig) -> Result<bool, CoreError> {
        match self.create_room(room_id, config, "system").await {
            Ok(_) => Ok(true),
            Err(CoreError::RoomExists(_)) => {
                self.store.set_add(keys::ROOM_INDEX, room_id).await?;
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Fresh read from the store, bypassing the cache.
    pub async fn load_room(&self, room_id: &str) -> Result<Option<Room>, CoreError> {
        match self.store.hash_get_all(&keys::room(room_id)).await? {
            Some(fields) => Ok(Some(room_from_fields(room_id, &fields)?)),
            None => Ok(None),
        }
    }

    /// Room metadata through the read-through cache. Counters and activity
    /// timestamps in the cached copy may be stale.
    pub async fn room_config(&self, room_id: &str) -> Result<Option<Arc<Room>>, CoreError> {
        if let Some(room) = self.cache.get(room_id).await {
            return Ok(Some(room));
        }
        match self.load_room(room_id).await? {
            Some(room) => {
                let room = Arc::new(room);
                self.cache.insert(room_id.to_string(), Arc::clone(&room)).await;
                Ok(Some(room))
            }
            None => Ok(None),
        }
    }

    pub async fn invalidate(&self, room_id: &str) {
        self.cache.invalidate(room_id).await;
    }

    pub async fn room_exists(&self, room_id: &str) -> Result<bool, CoreError> {
        Ok(self.store.exists(&keys::room(room_id)).await?)
    }

    pub async fn join_room(
        &self,
        room_id: &str,
        user_id: &str,
        display_name: &str,
        password: Option<&str>,
    ) -> Result<JoinOutcome, CoreError> {
        self.join(room_id, user_id, display_name, password, None).await
    }

    /// Join on behalf of one connection. The membership is held until every
    /// connection that joined through here has released it.
    pub async fn join_connection(
        &self,
        room_id: &str,
        user_id: &str,
        display_name: &str,
        password: Option<&str>,
        handle: &str,
    ) -> Result<JoinOutcome, CoreError> {
        self.join(room_id, user_id, display_name, password, Some(handle)).await
    }

    async fn join(
        &self,
        room_id: &str,
        user_id: &str,
        display_name: &str,
        password: Option<&str>,
        handle: Option<&str>,
    ) -> Result<JoinOutcome, CoreError> {
        let room = self
            .room_config(room_id)
            .await?
            .ok_or_else(|| CoreError::RoomNotFound(room_id.to_string()))?;
        let members_key = keys::room_members(room_id);
        let holders_key = keys::member_connections(room_id, user_id);

        let already_member = self.store.hash_get(&members_key, user_id).await?.is_some();
        if already_member && handle.is_none() {
            let snapshot = self.snapshot(room_id).await?;
            return Ok(JoinOutcome {
                snapshot,
                newly_joined: false,
            });
        }

        if room.is_private && !already_member {
            let Some(hash) = room.password_hash.clone() else {
                return Err(CoreError::Internal(format!("private room '{room_id}' has no password hash")));
            };
            let supplied = password.unwrap_or_default().to_string();
            if !auth::verify_password_blocking(supplied, hash).await? {
                return Err(CoreError::InvalidPassword);
            }
        }

        let capacity = room.capacity as usize;
        let inserted = match handle {
            Some(handle) => {
                self.store
                    .hash_insert_bounded_held(&members_key, user_id, display_name, capacity, &holders_key, handle)
                    .await?
            }
            None => {
                self.store
                    .hash_insert_bounded(&members_key, user_id, display_name, capacity)
                    .await?
            }
        };
        let newly_joined = match inserted {
            BoundedInsert::Full => {
                return Err(CoreError::RoomFull {
                    capacity: room.capacity,
                })
            }
            BoundedInsert::AlreadyPresent => false,
            BoundedInsert::Inserted => true,
        };

        // The room may have been deleted between the lookup and the insert.
        if !self.room_exists(room_id).await? {
            self.store.hash_remove(&members_key, user_id).await?;
            self.store.delete(&holders_key).await?;
            self.invalidate(room_id).await;
            return Err(CoreError::RoomNotFound(room_id.to_string()));
        }

        self.touch(room_id).await?;
        if newly_joined {
            tracing::debug!(room_id, user_id, "joined room");
        }
        let snapshot = self.snapshot(room_id).await?;
        Ok(JoinOutcome {
            snapshot,
            newly_joined,
        })
    }

    /// Remove the user outright, whatever connections hold the membership.
    /// Idempotent. Returns whether the user was a member.
    pub async fn leave_room(&self, room_id: &str, user_id: &str) -> Result<bool, CoreError> {
        let removed = self
            .store
            .hash_remove(&keys::room_members(room_id), user_id)
            .await?;
        self.store
            .delete(&keys::member_connections(room_id, user_id))
            .await?;
        self.store.set_remove(&keys::typing(room_id), user_id).await?;
        if removed {
            self.touch(room_id).await?;
            tracing::debug!(room_id, user_id, "left room");
        }
        Ok(removed)
    }

    /// Drop one connection's hold on a membership. The user leaves only when
    /// no connection on any node holds it any more. Returns whether they left.
    pub async fn release_connection(&self, room_id: &str, user_id: &str, handle: &str) -> Result<bool, CoreError> {
        let removed = self
            .store
            .release_hash_field(
                &keys::member_connections(room_id, user_id),
                handle,
                &keys::room_members(room_id),
                user_id,
            )
            .await?;
        if removed {
            self.store.set_remove(&keys::typing(room_id), user_id).await?;
            self.touch(room_id).await?;
            tracing::debug!(room_id, user_id, "left room");
        }
        Ok(removed)
    }

    pub async fn is_member(&self, room_id: &str, user_id: &str) -> Result<bool, CoreError> {
        Ok(self
            .store
            .hash_get(&keys::room_members(room_id), user_id)
            .await?
            .is_some())
    }

    pub async fn member_count(&self, room_id: &str) -> Result<usize, CoreError> {
        Ok(self.store.hash_len(&keys::room_members(room_id)).await?)
    }

    pub async fn members(&self, room_id: &str) -> Result<Vec<Member>, CoreError> {
        let members = self
            .store
            .hash_get_all(&keys::room_members(room_id))
            .await?
            .unwrap_or_default();
        let mut members: Vec<Member> = members
            .into_iter()
            .map(|(user_id, display_name)| Member {
                user_id,
                display_name,
            })
            .collect();
        members.sort_by(|a, b| {
            a.display_name
                .to_lowercase()
                .cmp(&b.display_name.to_lowercase())
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        Ok(members)
    }

    pub async fn snapshot(&self, room_id: &str) -> Result<RoomSnapshot, CoreError> {
        let room = self
            .load_room(room_id)
            .await?
            .ok_or_else(|| CoreError::RoomNotFound(room_id.to_string()))?;
        let members = self.members(room_id).await?;
        Ok(RoomSnapshot {
            room: room.summary(members.len()),
            members,
        })
    }

    pub async fn post_message(&self, draft: MessageDraft) -> Result<Message, CoreError> {
        self.post_message_with(draft, |_| Ok(None)).await
    }

    /// Append a message. `publish` may return a publication that the store
    /// emits in the same atomic step as the append.
    pub async fn post_message_with<F>(&self, draft: MessageDraft, publish: F) -> Result<Message, CoreError>
    where
        F: FnOnce(&Message) -> Result<Option<Publication>, CoreError> + Send,
    {
        let room_key = keys::room(&draft.room_id);
        if self
            .store
            .hash_incr_existing(&room_key, "message_count", 1)
            .await?
            .is_none()
        {
            return Err(CoreError::RoomNotFound(draft.room_id));
        }

        let message = Message {
            id: snowflake::generate_string(self.worker_id),
            room_id: draft.room_id,
            author_id: draft.author_id,
            author_name: draft.author_name,
            body: draft.body,
            kind: draft.kind,
            created_at: Utc::now(),
        };
        let entry = serde_json::to_string(&message)?;
        let publication = publish(&message)?;
        self.store
            .append(&keys::room_messages(&message.room_id), &entry, publication)
            .await?;
        self.touch(&message.room_id).await?;
        Ok(message)
    }

    /// Best-effort append-order tail: pages are addressed from the newest
    /// message, so appends during pagination shift later pages.
    pub async fn history(&self, room_id: &str, params: HistoryParams) -> Result<HistoryPage, CoreError> {
        if !self.room_exists(room_id).await? {
            return Err(CoreError::RoomNotFound(room_id.to_string()));
        }
        let log_key = keys::room_messages(room_id);
        let total = self.store.log_len(&log_key).await? as usize;
        let entries = self
            .store
            .log_tail(&log_key, params.limit(), params.offset())
            .await?;
        let has_more = params.offset() + entries.len() < total;
        Ok(HistoryPage {
            room_id: room_id.to_string(),
            messages: decode_messages(room_id, entries),
            has_more,
        })
    }

    pub async fn recent_messages(&self, room_id: &str, limit: usize) -> Result<Vec<Message>, CoreError> {
        let entries = self
            .store
            .log_tail(&keys::room_messages(room_id), limit, 0)
            .await?;
        Ok(decode_messages(room_id, entries))
    }

    pub async fn find_message(&self, room_id: &str, message_id: &str) -> Result<Option<Message>, CoreError> {
        let entries = self
            .store
            .log_tail(&keys::room_messages(room_id), MESSAGE_LOOKUP_WINDOW, 0)
            .await?;
        Ok(decode_messages(room_id, entries)
            .into_iter()
            .rev()
            .find(|m| m.id == message_id))
    }

    pub async fn list_rooms(&self) -> Result<Vec<RoomSummary>, CoreError> {
        let ids = self.store.set_members(keys::ROOM_INDEX).await?;
        let mut rooms = Vec::with_capacity(ids.len());
        for room_id in ids {
            match self.load_room(&room_id).await? {
                Some(room) => {
                    let members = self.member_count(&room_id).await?;
                    rooms.push(room.summary(members));
                }
                None => {
                    self.store.set_remove(keys::ROOM_INDEX, &room_id).await?;
                }
            }
        }
        rooms.sort_by(|a, b| {
            b.is_default
                .cmp(&a.is_default)
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        });
        Ok(rooms)
    }

    pub async fn summary(&self, room_id: &str) -> Result<RoomSummary, CoreError> {
        let room = self
            .load_room(room_id)
            .await?
            .ok_or_else(|| CoreError::RoomNotFound(room_id.to_string()))?;
        let members = self.member_count(room_id).await?;
        Ok(room.summary(members))
    }

    /// Only the creator or an admin may delete, only when the room is empty,
    /// and never a default room.
    pub async fn delete_room(&self, room_id: &str, requester: &Identity) -> Result<(), CoreError> {
        let room = self
            .load_room(room_id)
            .await?
            .ok_or_else(|| CoreError::RoomNotFound(room_id.to_string()))?;
        if room.is_default {
            return Err(CoreError::Forbidden("default rooms cannot be deleted".into()));
        }
        if room.created_by != requester.user_id && requester.role != Role::Admin {
            return Err(CoreError::Forbidden("only the creator or an admin may delete this room".into()));
        }
        if self.member_count(room_id).await? > 0 {
            return Err(CoreError::RoomNotEmpty);
        }
        self.purge_room(room_id).await?;
        tracing::info!(room_id, deleted_by = %requester.user_id, "room deleted");
        Ok(())
    }

    /// Delete non-default rooms that are empty and idle longer than `max_idle`.
    pub async fn cleanup_inactive_rooms(&self, max_idle: Duration) -> Result<usize, CoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_idle).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let mut deleted = 0;
        for room_id in self.store.set_members(keys::ROOM_INDEX).await? {
            let Some(room) = self.load_room(&room_id).await? else {
                self.store.set_remove(keys::ROOM_INDEX, &room_id).await?;
                continue;
            };
            if room.is_default || room.last_activity > cutoff {
                continue;
            }
            if self.member_count(&room_id).await? > 0 {
                continue;
            }
            self.purge_room(&room_id).await?;
            deleted += 1;
        }
        if deleted > 0 {
            tracing::info!(deleted, "cleaned up inactive rooms");
        }
        Ok(deleted)
    }

    /// Remove a user from every room. Returns the memberships removed.
    pub async fn remove_member_everywhere(&self, user_id: &str) -> Result<Vec<Departure>, CoreError> {
        let mut left = Vec::new();
        for room_id in self.store.set_members(keys::ROOM_INDEX).await? {
            let display_name = self.store.hash_get(&keys::room_members(&room_id), user_id).await?;
            if self.leave_room(&room_id, user_id).await? {
                left.push(Departure {
                    room_id,
                    user_id: user_id.to_string(),
                    display_name: display_name.unwrap_or_else(|| user_id.to_string()),
                });
            }
        }
        Ok(left)
    }

    /// Mark a user as typing. Returns true if they were not already typing.
    pub async fn set_typing(&self, room_id: &str, user_id: &str, ttl: Duration) -> Result<bool, CoreError> {
        let key = keys::typing(room_id);
        let added = self.store.set_add(&key, user_id).await?;
        self.store.expire(&key, ttl).await?;
        Ok(added)
    }

    pub async fn clear_typing(&self, room_id: &str, user_id: &str) -> Result<bool, CoreError> {
        Ok(self.store.set_remove(&keys::typing(room_id), user_id).await?)
    }

    pub async fn typing_users(&self, room_id: &str) -> Result<Vec<String>, CoreError> {
        Ok(self.store.set_members(&keys::typing(room_id)).await?)
    }

    async fn purge_room(&self, room_id: &str) -> Result<(), CoreError> {
        self.store.delete(&keys::room(room_id)).await?;
        self.store.delete(&keys::room_members(room_id)).await?;
        self.store.delete(&keys::room_messages(room_id)).await?;
        self.store.delete(&keys::typing(room_id)).await?;
        for holders in self.store.scan_prefix(&keys::member_connections_prefix(room_id)).await? {
            self.store.delete(&holders).await?;
        }
        self.store.set_remove(keys::ROOM_INDEX, room_id).await?;
        self.invalidate(room_id).await;
        Ok(())
    }

    async fn touch(&self, room_id: &str) -> Result<(), CoreError> {
        self.store
            .hash_set_if_exists(
                &keys::room(room_id),
                vec![("last_activity".to_string(), Utc::now().to_rfc3339())],
            )
            .await?;
        Ok(())
    }
}

fn decode_messages(room_id: &str, entries: Vec<String>) -> Vec<Message> {
    entries
        .into_iter()
        .filter_map(|raw| match serde_json::from_str::<Message>(&raw) {
            Ok(message) => Some(message),
            Err(err) => {
                tracing::warn!(room_id, error = %err, "skipping undecodable history entry");
                None
            }
        })
        .collect()
}

fn room_fields(room: &Room) -> Fields {
    vec![
        ("id".into(), room.id.clone()),
        ("name".into(), room.name.clone()),
        ("description".into(), room.description.clone()),
        ("is_private".into(), room.is_private.to_string()),
        ("password_hash".into(), room.password_hash.clone().unwrap_or_default()),
        ("capacity".into(), room.capacity.to_string()),
        ("created_by".into(), room.created_by.clone()),
        ("message_count".into(), room.message_count.to_string()),
        ("last_activity".into(), room.last_activity.to_rfc3339()),
        ("created_at".into(), room.created_at.to_rfc3339()),
        ("is_default".into(), room.is_default.to_string()),
    ]
}

fn room_from_fields(room_id: &str, fields: &HashMap<String, String>) -> Result<Room, StoreError> {
    let key = keys::room(room_id);
    let corrupt = |field: &str| StoreError::Corrupt {
        key: key.clone(),
        reason: format!("missing or malformed field '{field}'"),
    };
    let text = |field: &str| fields.get(field).cloned().ok_or_else(|| corrupt(field));
    let flag = |field: &str| -> Result<bool, StoreError> {
        fields
            .get(field)
            .and_then(|v| v.parse::<bool>().ok())
            .ok_or_else(|| corrupt(field))
    };
    let time = |field: &str| -> Result<DateTime<Utc>, StoreError> {
        fields
            .get(field)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.with_timezone(&Utc))
            .ok_or_else(|| corrupt(field))
    };

    let is_private = flag("is_private")?;
    let password_hash = fields.get("password_hash").filter(|h| !h.is_empty()).cloned();
    if is_private && password_hash.is_none() {
        return Err(corrupt("password_hash"));
    }
    Ok(Room {
        id: room_id.to_string(),
        name: text("name")?,
        description: fields.get("description").cloned().unwrap_or_default(),
        is_private,
        password_hash,
        capacity: fields
            .get("capacity")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| corrupt("capacity"))?,
        created_by: text("created_by")?,
        message_count: fields
            .get("message_count")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        last_activity: time("last_activity")?,
        created_at: time("created_at")?,
        is_default: flag("is_default").unwrap_or(false),
    })
}
