//! Wire protocol between a connected client and the gateway.
//!
//! Both directions use the same adjacently tagged JSON shape:
//! `{"event": "<name>", "data": { ... }}`. Commands without a payload may
//! omit `data`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::{HistoryPage, Message, MessageKind, PrivateMessage};
use crate::presence::OnlineUser;
use crate::room::{Member, RoomSummary};
use crate::user::Role;

/// Stable machine-readable error codes carried by every error event.
pub mod codes {
    pub const ROOM_NOT_FOUND: &str = "ROOM_NOT_FOUND";
    pub const ROOM_EXISTS: &str = "ROOM_EXISTS";
    pub const ROOM_FULL: &str = "ROOM_FULL";
    pub const ROOM_NOT_EMPTY: &str = "ROOM_NOT_EMPTY";
    pub const INVALID_PASSWORD: &str = "INVALID_PASSWORD";
    pub const NOT_IN_ROOM: &str = "NOT_IN_ROOM";
    pub const USER_OFFLINE: &str = "USER_OFFLINE";
    pub const MESSAGE_NOT_FOUND: &str = "MESSAGE_NOT_FOUND";
    pub const FORBIDDEN: &str = "FORBIDDEN";
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const INVALID_PAYLOAD: &str = "INVALID_PAYLOAD";
    pub const MESSAGE_RATE_LIMIT: &str = "MESSAGE_RATE_LIMIT";
    pub const UPLOAD_RATE_LIMIT: &str = "UPLOAD_RATE_LIMIT";
    pub const CONNECTION_RATE_LIMIT: &str = "CONNECTION_RATE_LIMIT";
    pub const FRAME_RATE_LIMIT: &str = "FRAME_RATE_LIMIT";
    pub const TOO_MANY_CONNECTIONS: &str = "TOO_MANY_CONNECTIONS";
    pub const SPAM_DETECTED: &str = "SPAM_DETECTED";
    pub const SPAM_WARNING: &str = "SPAM_WARNING";
    pub const SERVICE_UNAVAILABLE: &str = "SERVICE_UNAVAILABLE";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

// ── Client -> server ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientCommand {
    JoinRoom(JoinRoom),
    LeaveRoom(RoomRef),
    SendMessage(SendMessage),
    PrivateMessage(SendPrivateMessage),
    TypingStart(RoomRef),
    TypingStop(RoomRef),
    GetRoomUsers(RoomRef),
    GetOnlineUsers,
    ListRooms,
    CreateRoom(CreateRoom),
    DeleteRoom(RoomRef),
    DeleteMessage(DeleteMessage),
    GetHistory(GetHistory),
    Heartbeat,
}

impl ClientCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ClientCommand::JoinRoom(_) => "join-room",
            ClientCommand::LeaveRoom(_) => "leave-room",
            ClientCommand::SendMessage(_) => "send-message",
            ClientCommand::PrivateMessage(_) => "private-message",
            ClientCommand::TypingStart(_) => "typing-start",
            ClientCommand::TypingStop(_) => "typing-stop",
            ClientCommand::GetRoomUsers(_) => "get-room-users",
            ClientCommand::GetOnlineUsers => "get-online-users",
            ClientCommand::ListRooms => "list-rooms",
            ClientCommand::CreateRoom(_) => "create-room",
            ClientCommand::DeleteRoom(_) => "delete-room",
            ClientCommand::DeleteMessage(_) => "delete-message",
            ClientCommand::GetHistory(_) => "get-history",
            ClientCommand::Heartbeat => "heartbeat",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRef {
    pub room_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoom {
    pub room_id: String,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub room_id: String,
    pub content: String,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendPrivateMessage {
    pub recipient_id: String,
    pub content: String,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoom {
    pub room_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub capacity: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteMessage {
    pub room_id: String,
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetHistory {
    pub room_id: String,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

// ── Server -> client ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    Connected(Connected),
    RoomJoined(RoomJoined),
    RoomLeft(RoomLeft),
    UserJoined(MemberEvent),
    UserLeft(MemberEvent),
    NewMessage(Message),
    MessageDeleted(MessageDeleted),
    PrivateMessageReceived(PrivateMessage),
    PrivateMessageSent(PrivateMessage),
    UserTyping(TypingEvent),
    RoomUsersUpdated(RoomUsers),
    RoomUsers(RoomUsers),
    OnlineUsers(OnlineUsers),
    RoomList(RoomList),
    RoomCreated(RoomSummary),
    RoomDeleted(RoomDeleted),
    RoomHistory(HistoryPage),
    RateLimitExceeded(RateLimitNotice),
    MessageBlocked(ErrorNotice),
    RoomError(ErrorNotice),
    Error(ErrorNotice),
    HeartbeatAck,
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected(_) => "connected",
            ServerEvent::RoomJoined(_) => "room-joined",
            ServerEvent::RoomLeft(_) => "room-left",
            ServerEvent::UserJoined(_) => "user-joined",
            ServerEvent::UserLeft(_) => "user-left",
            ServerEvent::NewMessage(_) => "new-message",
            ServerEvent::MessageDeleted(_) => "message-deleted",
            ServerEvent::PrivateMessageReceived(_) => "private-message-received",
            ServerEvent::PrivateMessageSent(_) => "private-message-sent",
            ServerEvent::UserTyping(_) => "user-typing",
            ServerEvent::RoomUsersUpdated(_) => "room-users-updated",
            ServerEvent::RoomUsers(_) => "room-users",
            ServerEvent::OnlineUsers(_) => "online-users",
            ServerEvent::RoomList(_) => "room-list",
            ServerEvent::RoomCreated(_) => "room-created",
            ServerEvent::RoomDeleted(_) => "room-deleted",
            ServerEvent::RoomHistory(_) => "room-history",
            ServerEvent::RateLimitExceeded(_) => "rate-limit-exceeded",
            ServerEvent::MessageBlocked(_) => "message-blocked",
            ServerEvent::RoomError(_) => "room-error",
            ServerEvent::Error(_) => "error",
            ServerEvent::HeartbeatAck => "heartbeat-ack",
        }
    }

    /// Error code carried by error-type events.
    pub fn error_code(&self) -> Option<&str> {
        match self {
            ServerEvent::RateLimitExceeded(notice) => Some(notice.code.as_str()),
            ServerEvent::MessageBlocked(notice)
            | ServerEvent::RoomError(notice)
            | ServerEvent::Error(notice) => Some(notice.code.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connected {
    pub user_id: String,
    pub display_name: String,
    pub role: Role,
    pub connection_id: String,
    /// Milliseconds between client heartbeats.
    pub heartbeat_interval: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomJoined {
    pub room: RoomSummary,
    pub members: Vec<Member>,
    pub history: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomLeft {
    pub room_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberEvent {
    pub room_id: String,
    pub user_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeleted {
    pub room_id: String,
    pub message_id: String,
    pub deleted_by: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingEvent {
    pub room_id: String,
    pub user_id: String,
    pub display_name: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomUsers {
    pub room_id: String,
    pub users: Vec<Member>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUsers {
    pub users: Vec<OnlineUser>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomList {
    pub rooms: Vec<RoomSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomDeleted {
    pub room_id: String,
    pub deleted_by: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitNotice {
    pub code: String,
    pub message: String,
    pub action: String,
    pub count: u64,
    pub limit: u32,
    pub reset_time: DateTime<Utc>,
    pub retry_after_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorNotice {
    pub code: String,
    pub message: String,
}

impl ErrorNotice {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}
