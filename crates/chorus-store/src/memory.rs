use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::{
    BoundedInsert, Fields, Publication, SharedStore, StoreError, StoreResult, Subscription,
};

const CHANNEL_CAPACITY: usize = 1024;
const DEFAULT_LOG_CAP: usize = 10_000;

#[derive(Debug)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Set(BTreeSet<String>),
    Log(Vec<String>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

type Data = HashMap<String, Entry>;

/// In-process [`SharedStore`]. Several node states built over clones of the
/// same `Arc<MemoryStore>` behave like a fleet sharing one store.
///
/// All data lives behind a single mutex so compound operations are atomic.
/// Expiry is lazy on access and can also be swept with [`purge_expired`].
///
/// [`purge_expired`]: MemoryStore::purge_expired
pub struct MemoryStore {
    data: Mutex<Data>,
    channels: DashMap<String, broadcast::Sender<String>>,
    offline: AtomicBool,
    log_cap: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_log_cap(DEFAULT_LOG_CAP)
    }

    /// Logs keep only the newest `log_cap` entries.
    pub fn with_log_cap(log_cap: usize) -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
            channels: DashMap::new(),
            offline: AtomicBool::new(false),
            log_cap: log_cap.max(1),
        }
    }

    /// Simulate an outage: every call fails with `Unavailable` until reset.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Drop every expired key. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut data = self.lock();
        let before = data.len();
        data.retain(|_, entry| !entry.is_expired(now));
        before - data.len()
    }

    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let purged = store.purge_expired();
                if purged > 0 {
                    tracing::debug!(purged, "swept expired store keys");
                }
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, Data> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_online(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked offline".into()));
        }
        Ok(())
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    fn send(&self, channel: &str, payload: String) -> usize {
        match self.channels.get(channel) {
            Some(tx) => tx.send(payload).unwrap_or(0),
            None => 0,
        }
    }
}

/// Fetch a live entry, evicting it first if it has expired.
fn live<'a>(data: &'a mut Data, key: &str) -> Option<&'a mut Entry> {
    if data.get(key).is_some_and(|entry| entry.is_expired(Instant::now())) {
        data.remove(key);
    }
    data.get_mut(key)
}

fn as_hash<'a>(entry: &'a mut Entry, key: &str) -> StoreResult<&'a mut HashMap<String, String>> {
    match &mut entry.value {
        Value::Hash(hash) => Ok(hash),
        _ => Err(StoreError::WrongType(key.to_string())),
    }
}

fn as_set<'a>(entry: &'a mut Entry, key: &str) -> StoreResult<&'a mut BTreeSet<String>> {
    match &mut entry.value {
        Value::Set(set) => Ok(set),
        _ => Err(StoreError::WrongType(key.to_string())),
    }
}

fn as_log<'a>(entry: &'a mut Entry, key: &str) -> StoreResult<&'a mut Vec<String>> {
    match &mut entry.value {
        Value::Log(log) => Ok(log),
        _ => Err(StoreError::WrongType(key.to_string())),
    }
}

fn parse_int(key: &str, raw: &str) -> StoreResult<i64> {
    raw.parse::<i64>().map_err(|err| StoreError::Corrupt {
        key: key.to_string(),
        reason: err.to_string(),
    })
}

/// Capacity-checked insert on an already locked keyspace.
fn insert_bounded(data: &mut Data, key: &str, field: &str, value: &str, max: usize) -> StoreResult<BoundedInsert> {
    if live(data, key).is_none() {
        if max == 0 {
            return Ok(BoundedInsert::Full);
        }
        data.insert(key.to_string(), Entry::new(Value::Hash(HashMap::new()), None));
    }
    let Some(entry) = data.get_mut(key) else {
        return Err(StoreError::Unavailable(format!("key '{key}' vanished mid-operation")));
    };
    let hash = as_hash(entry, key)?;
    if hash.contains_key(field) {
        return Ok(BoundedInsert::AlreadyPresent);
    }
    if hash.len() >= max {
        return Ok(BoundedInsert::Full);
    }
    hash.insert(field.to_string(), value.to_string());
    Ok(BoundedInsert::Inserted)
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.ensure_online()?;
        let mut data = self.lock();
        match live(&mut data, key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.ensure_online()?;
        self.lock()
            .insert(key.to_string(), Entry::new(Value::Str(value.to_string()), ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.ensure_online()?;
        let mut data = self.lock();
        Ok(live(&mut data, key).is_some() && data.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.ensure_online()?;
        Ok(live(&mut self.lock(), key).is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.ensure_online()?;
        let mut data = self.lock();
        match live(&mut data, key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        self.ensure_online()?;
        let mut data = self.lock();
        let now = Instant::now();
        Ok(live(&mut data, key)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn incr(&self, key: &str, by: i64, ttl_if_new: Option<Duration>) -> StoreResult<i64> {
        self.ensure_online()?;
        let mut data = self.lock();
        match live(&mut data, key) {
            Some(entry) => match &mut entry.value {
                Value::Str(raw) => {
                    let next = parse_int(key, raw)? + by;
                    *raw = next.to_string();
                    Ok(next)
                }
                _ => Err(StoreError::WrongType(key.to_string())),
            },
            None => {
                data.insert(key.to_string(), Entry::new(Value::Str(by.to_string()), ttl_if_new));
                Ok(by)
            }
        }
    }

    async fn hash_create(&self, key: &str, fields: Fields, ttl: Option<Duration>) -> StoreResult<bool> {
        self.ensure_online()?;
        let mut data = self.lock();
        if live(&mut data, key).is_some() {
            return Ok(false);
        }
        data.insert(
            key.to_string(),
            Entry::new(Value::Hash(fields.into_iter().collect()), ttl),
        );
        Ok(true)
    }

    async fn hash_replace(&self, key: &str, fields: Fields, ttl: Option<Duration>) -> StoreResult<()> {
        self.ensure_online()?;
        self.lock().insert(
            key.to_string(),
            Entry::new(Value::Hash(fields.into_iter().collect()), ttl),
        );
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<Option<HashMap<String, String>>> {
        self.ensure_online()?;
        let mut data = self.lock();
        match live(&mut data, key) {
            Some(entry) => Ok(Some(as_hash(entry, key)?.clone())),
            None => Ok(None),
        }
    }

    async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        self.ensure_online()?;
        let mut data = self.lock();
        match live(&mut data, key) {
            Some(entry) => Ok(as_hash(entry, key)?.get(field).cloned()),
            None => Ok(None),
        }
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        self.ensure_online()?;
        let mut data = self.lock();
        if live(&mut data, key).is_none() {
            data.insert(key.to_string(), Entry::new(Value::Hash(HashMap::new()), None));
        }
        if let Some(entry) = data.get_mut(key) {
            as_hash(entry, key)?.insert(field.to_string(), value.to_string());
        }
        Ok(())
    }

    async fn hash_set_if_exists(&self, key: &str, fields: Fields) -> StoreResult<bool> {
        self.ensure_online()?;
        let mut data = self.lock();
        match live(&mut data, key) {
            Some(entry) => {
                as_hash(entry, key)?.extend(fields);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn hash_incr_existing(&self, key: &str, field: &str, by: i64) -> StoreResult<Option<i64>> {
        self.ensure_online()?;
        let mut data = self.lock();
        let Some(entry) = live(&mut data, key) else {
            return Ok(None);
        };
        let hash = as_hash(entry, key)?;
        let current = match hash.get(field) {
            Some(raw) => parse_int(key, raw)?,
            None => 0,
        };
        let next = current + by;
        hash.insert(field.to_string(), next.to_string());
        Ok(Some(next))
    }

    async fn hash_remove(&self, key: &str, field: &str) -> StoreResult<bool> {
        self.ensure_online()?;
        let mut data = self.lock();
        let Some(entry) = live(&mut data, key) else {
            return Ok(false);
        };
        let hash = as_hash(entry, key)?;
        let removed = hash.remove(field).is_some();
        if hash.is_empty() {
            data.remove(key);
        }
        Ok(removed)
    }

    async fn hash_len(&self, key: &str) -> StoreResult<usize> {
        self.ensure_online()?;
        let mut data = self.lock();
        match live(&mut data, key) {
            Some(entry) => Ok(as_hash(entry, key)?.len()),
            None => Ok(0),
        }
    }

    async fn hash_insert_bounded(
        &self,
        key: &str,
        field: &str,
        value: &str,
        max: usize,
    ) -> StoreResult<BoundedInsert> {
        self.ensure_online()?;
        let mut data = self.lock();
        insert_bounded(&mut data, key, field, value, max)
    }

    async fn hash_insert_bounded_held(
        &self,
        key: &str,
        field: &str,
        value: &str,
        max: usize,
        holders_key: &str,
        holder: &str,
    ) -> StoreResult<BoundedInsert> {
        self.ensure_online()?;
        let mut data = self.lock();
        if let Some(entry) = live(&mut data, holders_key) {
            as_set(entry, holders_key)?;
        }
        let outcome = insert_bounded(&mut data, key, field, value, max)?;
        if outcome != BoundedInsert::Full {
            let entry = data
                .entry(holders_key.to_string())
                .or_insert_with(|| Entry::new(Value::Set(BTreeSet::new()), None));
            as_set(entry, holders_key)?.insert(holder.to_string());
        }
        Ok(outcome)
    }

    async fn release_hash_field(
        &self,
        holders_key: &str,
        holder: &str,
        key: &str,
        field: &str,
    ) -> StoreResult<bool> {
        self.ensure_online()?;
        let mut data = self.lock();
        if let Some(entry) = live(&mut data, holders_key) {
            let set = as_set(entry, holders_key)?;
            set.remove(holder);
            if !set.is_empty() {
                return Ok(false);
            }
            data.remove(holders_key);
        }
        let Some(entry) = live(&mut data, key) else {
            return Ok(false);
        };
        let hash = as_hash(entry, key)?;
        let removed = hash.remove(field).is_some();
        if hash.is_empty() {
            data.remove(key);
        }
        Ok(removed)
    }

    async fn delete_if_field_eq(&self, key: &str, field: &str, expected: &str) -> StoreResult<bool> {
        self.ensure_online()?;
        let mut data = self.lock();
        let Some(entry) = live(&mut data, key) else {
            return Ok(false);
        };
        if as_hash(entry, key)?.get(field).map(String::as_str) != Some(expected) {
            return Ok(false);
        }
        data.remove(key);
        Ok(true)
    }

    async fn update_if_field_eq(
        &self,
        key: &str,
        field: &str,
        expected: &str,
        updates: Fields,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        self.ensure_online()?;
        let mut data = self.lock();
        let Some(entry) = live(&mut data, key) else {
            return Ok(false);
        };
        let hash = as_hash(entry, key)?;
        if hash.get(field).map(String::as_str) != Some(expected) {
            return Ok(false);
        }
        hash.extend(updates);
        if let Some(ttl) = ttl {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(true)
    }

    async fn set_add(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.ensure_online()?;
        let mut data = self.lock();
        if live(&mut data, key).is_none() {
            data.insert(key.to_string(), Entry::new(Value::Set(BTreeSet::new()), None));
        }
        match data.get_mut(key) {
            Some(entry) => Ok(as_set(entry, key)?.insert(member.to_string())),
            None => Ok(false),
        }
    }

    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.ensure_online()?;
        let mut data = self.lock();
        let Some(entry) = live(&mut data, key) else {
            return Ok(false);
        };
        let set = as_set(entry, key)?;
        let removed = set.remove(member);
        if set.is_empty() {
            data.remove(key);
        }
        Ok(removed)
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        self.ensure_online()?;
        let mut data = self.lock();
        match live(&mut data, key) {
            Some(entry) => Ok(as_set(entry, key)?.iter().cloned().collect()),
            None => Ok(Vec::new()),
        }
    }

    async fn set_contains(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.ensure_online()?;
        let mut data = self.lock();
        match live(&mut data, key) {
            Some(entry) => Ok(as_set(entry, key)?.contains(member)),
            None => Ok(false),
        }
    }

    async fn append(&self, key: &str, entry: &str, publication: Option<Publication>) -> StoreResult<u64> {
        self.ensure_online()?;
        let mut data = self.lock();
        if live(&mut data, key).is_none() {
            data.insert(key.to_string(), Entry::new(Value::Log(Vec::new()), None));
        }
        let Some(slot) = data.get_mut(key) else {
            return Err(StoreError::Unavailable(format!("key '{key}' vanished mid-operation")));
        };
        let log = as_log(slot, key)?;
        log.push(entry.to_string());
        if log.len() > self.log_cap {
            let excess = log.len() - self.log_cap;
            log.drain(..excess);
        }
        let len = log.len() as u64;
        // Published while the data lock is held so append order is delivery order.
        if let Some(publication) = publication {
            self.send(&publication.channel, publication.payload);
        }
        Ok(len)
    }

    async fn log_tail(&self, key: &str, limit: usize, offset: usize) -> StoreResult<Vec<String>> {
        self.ensure_online()?;
        let mut data = self.lock();
        let Some(entry) = live(&mut data, key) else {
            return Ok(Vec::new());
        };
        let log = as_log(entry, key)?;
        let end = log.len().saturating_sub(offset);
        let start = end.saturating_sub(limit);
        Ok(log[start..end].to_vec())
    }

    async fn log_len(&self, key: &str) -> StoreResult<u64> {
        self.ensure_online()?;
        let mut data = self.lock();
        match live(&mut data, key) {
            Some(entry) => Ok(as_log(entry, key)?.len() as u64),
            None => Ok(0),
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.ensure_online()?;
        let now = Instant::now();
        let data = self.lock();
        let mut keys: Vec<String> = data
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && !entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<usize> {
        self.ensure_online()?;
        Ok(self.send(channel, payload.to_string()))
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        self.ensure_online()?;
        Ok(Subscription::new(channel, self.sender(channel).subscribe()))
    }
}
