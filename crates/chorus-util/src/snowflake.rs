use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Custom epoch: 2025-01-01T00:00:00Z
const CHORUS_EPOCH: u64 = 1_735_689_600_000;

/// Worker ids occupy 10 bits.
pub const MAX_WORKER_ID: u16 = 0x3FF;

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Generate a Snowflake ID.
/// Format: 42 bits timestamp | 10 bits worker | 12 bits sequence
///
/// Distinct nodes sharing one store must use distinct worker ids.
pub fn generate(worker_id: u16) -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let timestamp = now.saturating_sub(CHORUS_EPOCH);
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed) & 0xFFF;
    let id = (timestamp << 22) | (((worker_id & MAX_WORKER_ID) as u64) << 12) | seq;
    id as i64
}

/// Snowflake rendered the way it travels on the wire.
pub fn generate_string(worker_id: u16) -> String {
    generate(worker_id).to_string()
}

/// Extract the Unix timestamp (ms) from a snowflake.
pub fn timestamp_millis(id: i64) -> u64 {
    ((id as u64) >> 22) + CHORUS_EPOCH
}

pub fn worker_of(id: i64) -> u16 {
    ((id as u64) >> 12) as u16 & MAX_WORKER_ID
}

/// Stable worker id derived from a node id (FNV-1a folded to 10 bits), for
/// nodes that are not assigned one explicitly.
pub fn worker_id_for(node_id: &str) -> u16 {
    let hash = node_id.bytes().fold(0x811c_9dc5_u32, |hash, byte| {
        (hash ^ byte as u32).wrapping_mul(0x0100_0193)
    });
    (hash ^ (hash >> 10) ^ (hash >> 20)) as u16 & MAX_WORKER_ID
}
