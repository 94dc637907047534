use std::collections::HashMap;
use std::fs;
use std::time::Duration;

use anyhow::{bail, Result};
use chorus_core::auth::StaticTokenAuthenticator;
use chorus_core::rate_limit::{Budget, RateBudgets};
use chorus_core::spam::SpamThresholds;
use chorus_core::{AppConfig, DefaultRoom};
use chorus_models::room::{DEFAULT_ROOM_CAPACITY, MAX_ROOM_CAPACITY, MIN_ROOM_CAPACITY};
use chorus_models::user::{Identity, Role};
use chorus_util::snowflake;
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub spam: SpamConfig,
    #[serde(default)]
    pub rooms: RoomsConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub guests: GuestsConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Must differ between processes sharing a store. Generated at startup
    /// when unset.
    pub node_id: Option<String>,
    /// Snowflake worker, 0..=1023. Derived from the node id when unset.
    pub worker_id: Option<u16>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            node_id: None,
            worker_id: None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct LimitsConfig {
    #[serde(default = "default_messages_per_window")]
    pub messages_per_window: u32,
    #[serde(default = "default_connections_per_window")]
    pub connections_per_window: u32,
    #[serde(default = "default_uploads_per_window")]
    pub uploads_per_window: u32,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_connections_per_user")]
    pub max_connections_per_user: usize,
    #[serde(default = "default_frames_per_minute")]
    pub frames_per_minute: u32,
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            messages_per_window: default_messages_per_window(),
            connections_per_window: default_connections_per_window(),
            uploads_per_window: default_uploads_per_window(),
            window_seconds: default_window_seconds(),
            max_connections: default_max_connections(),
            max_connections_per_user: default_max_connections_per_user(),
            frames_per_minute: default_frames_per_minute(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SpamConfig {
    #[serde(default = "default_warn_threshold")]
    pub warn_threshold: i64,
    #[serde(default = "default_block_threshold")]
    pub block_threshold: i64,
    #[serde(default = "default_decay_seconds")]
    pub decay_seconds: u64,
}

impl Default for SpamConfig {
    fn default() -> Self {
        Self {
            warn_threshold: default_warn_threshold(),
            block_threshold: default_block_threshold(),
            decay_seconds: default_decay_seconds(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DefaultRoomConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RoomsConfig {
    #[serde(default = "default_rooms")]
    pub default_rooms: Vec<DefaultRoomConfig>,
    #[serde(default = "default_capacity")]
    pub default_capacity: u32,
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,
    /// Messages sent with `room-joined`.
    #[serde(default = "default_history_page_size")]
    pub history_page_size: usize,
    #[serde(default = "default_idle_cleanup_seconds")]
    pub idle_cleanup_seconds: u64,
    #[serde(default = "default_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,
}

impl Default for RoomsConfig {
    fn default() -> Self {
        Self {
            default_rooms: default_rooms(),
            default_capacity: default_capacity(),
            max_message_length: default_max_message_length(),
            history_page_size: default_history_page_size(),
            idle_cleanup_seconds: default_idle_cleanup_seconds(),
            cleanup_interval_seconds: default_cleanup_interval_seconds(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PresenceConfig {
    #[serde(default = "default_presence_ttl_seconds")]
    pub ttl_seconds: u64,
    #[serde(default = "default_heartbeat_interval_seconds")]
    pub heartbeat_interval_seconds: u64,
    #[serde(default = "default_heartbeat_timeout_seconds")]
    pub heartbeat_timeout_seconds: u64,
    #[serde(default = "default_typing_timeout_ms")]
    pub typing_timeout_ms: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_presence_ttl_seconds(),
            heartbeat_interval_seconds: default_heartbeat_interval_seconds(),
            heartbeat_timeout_seconds: default_heartbeat_timeout_seconds(),
            typing_timeout_ms: default_typing_timeout_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GuestsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_guest_idle_seconds")]
    pub idle_seconds: u64,
}

impl Default for GuestsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_seconds: default_guest_idle_seconds(),
        }
    }
}

/// Tokens accepted at the gateway. Issuing them is someone else's job.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenConfig {
    pub token: String,
    pub user_id: String,
    pub display_name: String,
    #[serde(default = "default_role")]
    pub role: Role,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

fn generate_random_hex(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| format!("{:x}", rng.gen_range(0..16u8)))
        .collect()
}

fn default_bind_address() -> String {
    "0.0.0.0:8080".into()
}
fn default_messages_per_window() -> u32 {
    10
}
fn default_connections_per_window() -> u32 {
    5
}
fn default_uploads_per_window() -> u32 {
    3
}
fn default_window_seconds() -> u64 {
    60
}
fn default_max_connections() -> usize {
    10_000
}
fn default_max_connections_per_user() -> usize {
    5
}
fn default_frames_per_minute() -> u32 {
    240
}
fn default_outbound_buffer() -> usize {
    256
}
fn default_warn_threshold() -> i64 {
    3
}
fn default_block_threshold() -> i64 {
    5
}
fn default_decay_seconds() -> u64 {
    3600
}
fn default_rooms() -> Vec<DefaultRoomConfig> {
    vec![
        DefaultRoomConfig {
            id: "general".into(),
            name: "General".into(),
            description: "General discussion".into(),
        },
        DefaultRoomConfig {
            id: "random".into(),
            name: "Random".into(),
            description: "Off-topic chatter".into(),
        },
    ]
}
fn default_capacity() -> u32 {
    DEFAULT_ROOM_CAPACITY
}
fn default_max_message_length() -> usize {
    500
}
fn default_history_page_size() -> usize {
    50
}
fn default_idle_cleanup_seconds() -> u64 {
    24 * 3600
}
fn default_cleanup_interval_seconds() -> u64 {
    3600
}
fn default_presence_ttl_seconds() -> u64 {
    120
}
fn default_heartbeat_interval_seconds() -> u64 {
    30
}
fn default_heartbeat_timeout_seconds() -> u64 {
    90
}
fn default_typing_timeout_ms() -> u64 {
    3000
}
fn default_true() -> bool {
    true
}
fn default_guest_idle_seconds() -> u64 {
    24 * 3600
}
fn default_role() -> Role {
    Role::User
}

fn generate_config_template(config: &Config) -> String {
    let rooms: String = config
        .rooms
        .default_rooms
        .iter()
        .map(|room| {
            format!(
                "\n[[rooms.default_rooms]]\nid = \"{}\"\nname = \"{}\"\ndescription = \"{}\"\n",
                room.id, room.name, room.description
            )
        })
        .collect();

    format!(
        r#"# Chorus Server Configuration
# Generated automatically on first run. Edit as needed.

[server]
bind_address = "{bind_address}"
# Unique per process when several nodes share one store. Random when unset.
# node_id = "node-a"
# Message id worker, 0-1023. Derived from node_id when unset; set it
# explicitly to rule out collisions between nodes.
# worker_id = 1

[limits]
# Fixed-window budgets per user (messages, uploads) and per address (connections).
messages_per_window = {messages}
connections_per_window = {connections}
uploads_per_window = {uploads}
window_seconds = {window}
max_connections = {max_connections}
max_connections_per_user = {max_per_user}
frames_per_minute = {frames}
outbound_buffer = {outbound_buffer}

[spam]
warn_threshold = {warn}
block_threshold = {block}
decay_seconds = {decay}

[presence]
ttl_seconds = {presence_ttl}
heartbeat_interval_seconds = {heartbeat_interval}
heartbeat_timeout_seconds = {heartbeat_timeout}
typing_timeout_ms = {typing_timeout}

[guests]
enabled = {guests_enabled}
idle_seconds = {guest_idle}

[auth]
# Static tokens accepted at /gateway?token=... or as a Bearer header.
# [[auth.tokens]]
# token = "change-me"
# user_id = "alice"
# display_name = "Alice"
# role = "admin"

[rooms]
default_capacity = {capacity}
max_message_length = {max_message}
history_page_size = {history}
idle_cleanup_seconds = {idle_cleanup}
cleanup_interval_seconds = {cleanup_interval}
{rooms}"#,
        bind_address = config.server.bind_address,
        messages = config.limits.messages_per_window,
        connections = config.limits.connections_per_window,
        uploads = config.limits.uploads_per_window,
        window = config.limits.window_seconds,
        max_connections = config.limits.max_connections,
        max_per_user = config.limits.max_connections_per_user,
        frames = config.limits.frames_per_minute,
        outbound_buffer = config.limits.outbound_buffer,
        warn = config.spam.warn_threshold,
        block = config.spam.block_threshold,
        decay = config.spam.decay_seconds,
        presence_ttl = config.presence.ttl_seconds,
        heartbeat_interval = config.presence.heartbeat_interval_seconds,
        heartbeat_timeout = config.presence.heartbeat_timeout_seconds,
        typing_timeout = config.presence.typing_timeout_ms,
        guests_enabled = config.guests.enabled,
        guest_idle = config.guests.idle_seconds,
        capacity = config.rooms.default_capacity,
        max_message = config.rooms.max_message_length,
        history = config.rooms.history_page_size,
        idle_cleanup = config.rooms.idle_cleanup_seconds,
        cleanup_interval = config.rooms.cleanup_interval_seconds,
        rooms = rooms,
    )
}

fn env_parse<T: std::str::FromStr>(name: &str, target: &mut T) {
    if let Ok(value) = std::env::var(name) {
        match value.trim().parse::<T>() {
            Ok(parsed) => *target = parsed,
            Err(_) => tracing::warn!("Ignoring invalid {} value '{}'", name, value),
        }
    }
}

fn env_parse_opt<T: std::str::FromStr>(name: &str, target: &mut Option<T>) {
    if let Ok(value) = std::env::var(name) {
        match value.trim().parse::<T>() {
            Ok(parsed) => *target = Some(parsed),
            Err(_) => tracing::warn!("Ignoring invalid {} value '{}'", name, value),
        }
    }
}

/// `id:Name` pairs separated by commas; the name defaults to the id.
fn parse_default_rooms(raw: &str) -> Vec<DefaultRoomConfig> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (id, name) = entry.split_once(':').unwrap_or((entry, entry));
            DefaultRoomConfig {
                id: id.trim().to_string(),
                name: name.trim().to_string(),
                description: String::new(),
            }
        })
        .collect()
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let mut config = if std::path::Path::new(path).exists() {
            let content = fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            tracing::info!("Config file not found at '{}', generating defaults...", path);
            let config = Config::default();
            if let Some(parent) = std::path::Path::new(path).parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, generate_config_template(&config))?;
            tracing::info!("Generated default config at '{}'", path);
            config
        };

        if let Ok(value) = std::env::var("CHORUS_BIND_ADDRESS") {
            config.server.bind_address = value;
        }
        if let Ok(value) = std::env::var("CHORUS_NODE_ID") {
            config.server.node_id = Some(value);
        }
        env_parse_opt("CHORUS_WORKER_ID", &mut config.server.worker_id);
        env_parse("CHORUS_MESSAGES_PER_WINDOW", &mut config.limits.messages_per_window);
        env_parse("CHORUS_CONNECTIONS_PER_WINDOW", &mut config.limits.connections_per_window);
        env_parse("CHORUS_UPLOADS_PER_WINDOW", &mut config.limits.uploads_per_window);
        env_parse("CHORUS_RATE_WINDOW_SECONDS", &mut config.limits.window_seconds);
        env_parse("CHORUS_MAX_CONNECTIONS", &mut config.limits.max_connections);
        env_parse("CHORUS_MAX_CONNECTIONS_PER_USER", &mut config.limits.max_connections_per_user);
        env_parse("CHORUS_FRAMES_PER_MINUTE", &mut config.limits.frames_per_minute);
        env_parse("CHORUS_PRESENCE_TTL_SECONDS", &mut config.presence.ttl_seconds);
        env_parse("CHORUS_HEARTBEAT_INTERVAL_SECONDS", &mut config.presence.heartbeat_interval_seconds);
        env_parse("CHORUS_MAX_MESSAGE_LENGTH", &mut config.rooms.max_message_length);
        env_parse("CHORUS_ROOM_IDLE_SECONDS", &mut config.rooms.idle_cleanup_seconds);
        env_parse("CHORUS_CLEANUP_INTERVAL_SECONDS", &mut config.rooms.cleanup_interval_seconds);
        env_parse("CHORUS_GUESTS_ENABLED", &mut config.guests.enabled);
        env_parse("CHORUS_GUEST_IDLE_SECONDS", &mut config.guests.idle_seconds);
        if let Ok(value) = std::env::var("CHORUS_DEFAULT_ROOMS") {
            config.rooms.default_rooms = parse_default_rooms(&value);
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.limits.window_seconds == 0 {
            bail!("limits.window_seconds must be positive");
        }
        if self.spam.block_threshold < self.spam.warn_threshold {
            bail!("spam.block_threshold must not be below spam.warn_threshold");
        }
        if !(MIN_ROOM_CAPACITY..=MAX_ROOM_CAPACITY).contains(&self.rooms.default_capacity) {
            bail!(
                "rooms.default_capacity must be between {} and {}",
                MIN_ROOM_CAPACITY,
                MAX_ROOM_CAPACITY
            );
        }
        for room in &self.rooms.default_rooms {
            chorus_util::validation::validate_room_id(&room.id)
                .map_err(|e| anyhow::anyhow!("default room '{}': {}", room.id, e))?;
        }
        if self.server.worker_id.is_some_and(|id| id > snowflake::MAX_WORKER_ID) {
            bail!("server.worker_id must be at most {}", snowflake::MAX_WORKER_ID);
        }
        if self.presence.heartbeat_timeout_seconds <= self.presence.heartbeat_interval_seconds {
            bail!("presence.heartbeat_timeout_seconds must exceed heartbeat_interval_seconds");
        }
        let mut seen = HashMap::new();
        for entry in &self.auth.tokens {
            if seen.insert(entry.token.as_str(), entry.user_id.as_str()).is_some() {
                bail!("auth token for '{}' is listed twice", entry.user_id);
            }
        }
        Ok(())
    }

    pub fn node_id(&self) -> String {
        self.server
            .node_id
            .clone()
            .unwrap_or_else(|| format!("node-{}", generate_random_hex(8)))
    }

    pub fn app_config(&self, node_id: String) -> AppConfig {
        let window = Duration::from_secs(self.limits.window_seconds);
        let worker_id = self
            .server
            .worker_id
            .unwrap_or_else(|| snowflake::worker_id_for(&node_id));
        AppConfig {
            node_id,
            worker_id,
            budgets: RateBudgets {
                message: Budget {
                    limit: self.limits.messages_per_window,
                    window,
                },
                connection: Budget {
                    limit: self.limits.connections_per_window,
                    window,
                },
                upload: Budget {
                    limit: self.limits.uploads_per_window,
                    window,
                },
            },
            spam: SpamThresholds {
                warn: self.spam.warn_threshold,
                block: self.spam.block_threshold,
                decay: Duration::from_secs(self.spam.decay_seconds),
            },
            max_message_chars: self.rooms.max_message_length,
            join_history: self.rooms.history_page_size,
            default_room_capacity: self.rooms.default_capacity,
            default_rooms: self
                .rooms
                .default_rooms
                .iter()
                .map(|room| DefaultRoom::new(&room.id, &room.name, &room.description))
                .collect(),
            presence_ttl: Duration::from_secs(self.presence.ttl_seconds),
            heartbeat_interval: Duration::from_secs(self.presence.heartbeat_interval_seconds),
            heartbeat_timeout: Duration::from_secs(self.presence.heartbeat_timeout_seconds),
            typing_timeout: Duration::from_millis(self.presence.typing_timeout_ms),
            guests_enabled: self.guests.enabled,
            guest_idle: Duration::from_secs(self.guests.idle_seconds),
            max_connections: self.limits.max_connections,
            max_connections_per_user: self.limits.max_connections_per_user,
            outbound_buffer: self.limits.outbound_buffer,
            frames_per_minute: self.limits.frames_per_minute,
            ..AppConfig::default()
        }
    }

    pub fn authenticator(&self) -> StaticTokenAuthenticator {
        self.auth
            .tokens
            .iter()
            .fold(StaticTokenAuthenticator::default(), |auth, entry| {
                auth.with_token(
                    entry.token.clone(),
                    Identity::new(entry.user_id.clone(), entry.display_name.clone(), entry.role),
                )
            })
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.rooms.cleanup_interval_seconds.max(1))
    }

    pub fn room_idle(&self) -> Duration {
        Duration::from_secs(self.rooms.idle_cleanup_seconds)
    }
}
