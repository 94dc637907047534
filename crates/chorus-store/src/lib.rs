//! Shared state store used as the single source of truth across nodes.
//!
//! Every node talks to the store through [`SharedStore`]. Compound
//! operations (`hash_insert_bounded`, `delete_if_field_eq`, `append` with a
//! publication) are atomic with respect to every other store call, which is
//! what lets room capacity, presence ownership and per-room ordering hold
//! without distributed locks.

pub mod memory;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("shared store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt value at '{key}': {reason}")]
    Corrupt { key: String, reason: String },
    #[error("wrong value type at '{0}'")]
    WrongType(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Owned field/value pairs written into a hash.
pub type Fields = Vec<(String, String)>;

/// Outcome of a capacity-checked hash insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundedInsert {
    Inserted,
    AlreadyPresent,
    Full,
}

/// A message to publish as part of the same atomic step as an append.
#[derive(Debug, Clone)]
pub struct Publication {
    pub channel: String,
    pub payload: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecvError {
    #[error("subscriber lagged, {0} messages skipped")]
    Lagged(u64),
    #[error("channel closed")]
    Closed,
}

/// A live subscription to one pub/sub channel.
pub struct Subscription {
    channel: String,
    rx: broadcast::Receiver<String>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, rx: broadcast::Receiver<String>) -> Self {
        Self {
            channel: channel.into(),
            rx,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub async fn recv(&mut self) -> Result<String, RecvError> {
        match self.rx.recv().await {
            Ok(payload) => Ok(payload),
            Err(broadcast::error::RecvError::Lagged(skipped)) => Err(RecvError::Lagged(skipped)),
            Err(broadcast::error::RecvError::Closed) => Err(RecvError::Closed),
        }
    }
}

#[async_trait]
pub trait SharedStore: Send + Sync {
    // ── Plain keys and counters ─────────────────────────────────────────────
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;
    async fn delete(&self, key: &str) -> StoreResult<bool>;
    async fn exists(&self, key: &str) -> StoreResult<bool>;
    /// Returns false when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;
    /// Remaining lifetime, or `None` for missing or persistent keys.
    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;
    /// Atomically add `by` to an integer key. `ttl_if_new` applies only when
    /// the increment creates the key.
    async fn incr(&self, key: &str, by: i64, ttl_if_new: Option<Duration>) -> StoreResult<i64>;

    // ── Hashes ─────────────────────────────────────────────────────────────
    /// Create a hash only if the key is absent. Returns false on conflict.
    async fn hash_create(&self, key: &str, fields: Fields, ttl: Option<Duration>) -> StoreResult<bool>;
    /// Replace the whole hash, resetting its TTL.
    async fn hash_replace(&self, key: &str, fields: Fields, ttl: Option<Duration>) -> StoreResult<()>;
    async fn hash_get_all(&self, key: &str) -> StoreResult<Option<HashMap<String, String>>>;
    async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>>;
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> StoreResult<()>;
    /// Update fields only if the hash exists. Never resurrects a deleted key.
    async fn hash_set_if_exists(&self, key: &str, fields: Fields) -> StoreResult<bool>;
    async fn hash_incr_existing(&self, key: &str, field: &str, by: i64) -> StoreResult<Option<i64>>;
    async fn hash_remove(&self, key: &str, field: &str) -> StoreResult<bool>;
    async fn hash_len(&self, key: &str) -> StoreResult<usize>;
    /// Insert `field` unless the hash already holds `max` fields.
    async fn hash_insert_bounded(
        &self,
        key: &str,
        field: &str,
        value: &str,
        max: usize,
    ) -> StoreResult<BoundedInsert>;
    /// `hash_insert_bounded`, and unless the hash is full also add `holder`
    /// to the set at `holders_key`, in one atomic step.
    async fn hash_insert_bounded_held(
        &self,
        key: &str,
        field: &str,
        value: &str,
        max: usize,
        holders_key: &str,
        holder: &str,
    ) -> StoreResult<BoundedInsert>;
    /// Remove `holder` from the set at `holders_key`. If no holders remain,
    /// remove `field` from the hash at `key` in the same atomic step.
    /// Returns whether the hash field was removed.
    async fn release_hash_field(&self, holders_key: &str, holder: &str, key: &str, field: &str)
        -> StoreResult<bool>;
    /// Delete the key only if `field` currently equals `expected`.
    async fn delete_if_field_eq(&self, key: &str, field: &str, expected: &str) -> StoreResult<bool>;
    /// Apply `updates` (and optionally reset the TTL) only if `field`
    /// currently equals `expected`.
    async fn update_if_field_eq(
        &self,
        key: &str,
        field: &str,
        expected: &str,
        updates: Fields,
        ttl: Option<Duration>,
    ) -> StoreResult<bool>;

    // ── Sets ───────────────────────────────────────────────────────────────
    async fn set_add(&self, key: &str, member: &str) -> StoreResult<bool>;
    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<bool>;
    /// Members in lexicographic order.
    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>>;
    async fn set_contains(&self, key: &str, member: &str) -> StoreResult<bool>;

    // ── Append logs ────────────────────────────────────────────────────────
    /// Append an entry and, in the same atomic step, publish `publication`.
    /// Returns the log length after the append.
    async fn append(&self, key: &str, entry: &str, publication: Option<Publication>) -> StoreResult<u64>;
    /// The `limit` entries preceding the newest `offset` ones, oldest first.
    async fn log_tail(&self, key: &str, limit: usize, offset: usize) -> StoreResult<Vec<String>>;
    async fn log_len(&self, key: &str) -> StoreResult<u64>;

    // ── Discovery and pub/sub ───────────────────────────────────────────────
    /// Live keys starting with `prefix`, sorted.
    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;
    /// Returns the number of subscribers that received the payload.
    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<usize>;
    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription>;
}
