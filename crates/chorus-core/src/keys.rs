//! Key layout in the shared store. Every node must agree on these.

pub const ROOM_INDEX: &str = "rooms";
pub const GUEST_INDEX: &str = "guests";
pub const PRESENCE_PREFIX: &str = "presence:";

pub fn room(room_id: &str) -> String {
    format!("room:{room_id}")
}

/// Hash of user id -> display name.
pub fn room_members(room_id: &str) -> String {
    format!("room:{room_id}:members")
}

/// Set of connection handles holding a user's membership.
pub fn member_connections(room_id: &str, user_id: &str) -> String {
    format!("room:{room_id}:conns:{user_id}")
}

pub fn member_connections_prefix(room_id: &str) -> String {
    format!("room:{room_id}:conns:")
}

/// Append log of serialized messages.
pub fn room_messages(room_id: &str) -> String {
    format!("room:{room_id}:messages")
}

pub fn typing(room_id: &str) -> String {
    format!("typing:{room_id}")
}

pub fn presence(user_id: &str) -> String {
    format!("{PRESENCE_PREFIX}{user_id}")
}

pub fn guest(guest_id: &str) -> String {
    format!("guest:{guest_id}")
}

pub fn rate(action: &str, subject: &str, bucket: i64) -> String {
    format!("rate:{action}:{subject}:{bucket}")
}

pub fn spam_score(subject: &str) -> String {
    format!("spam:{subject}")
}
