use chorus_models::gateway::codes;
use chorus_store::StoreError;
use chorus_util::validation::ValidationError;
use thiserror::Error;

use crate::fanout::AdmissionError;
use crate::rate_limit::{RateAction, RateDecision};

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("room '{0}' does not exist")]
    RoomNotFound(String),
    #[error("incorrect room password")]
    InvalidPassword,
    #[error("room is full (capacity {capacity})")]
    RoomFull { capacity: u32 },
    #[error("room '{0}' already exists")]
    RoomExists(String),
    #[error("room still has members")]
    RoomNotEmpty,
    #[error("not a member of room '{0}'")]
    NotInRoom(String),
    #[error("user '{0}' is not online")]
    UserOffline(String),
    #[error("message not found")]
    MessageNotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("too many connections: {0}")]
    TooManyConnections(#[from] AdmissionError),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("invalid input: {0}")]
    Validation(#[from] ValidationError),
    #[error("rate limit exceeded for {action}")]
    RateLimited {
        action: RateAction,
        decision: RateDecision,
    },
    #[error("message blocked as spam (score {score})")]
    SpamBlocked { score: i64 },
    #[error("shared store unavailable: {0}")]
    DependencyUnavailable(#[from] StoreError),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse class of a failure, used when picking the client-facing event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    NotFound,
    Forbidden,
    Conflict,
    Validation,
    RateLimited,
    SpamBlocked,
    DependencyUnavailable,
    Internal,
}

impl CoreError {
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::RoomNotFound(_) => codes::ROOM_NOT_FOUND,
            CoreError::InvalidPassword => codes::INVALID_PASSWORD,
            CoreError::RoomFull { .. } => codes::ROOM_FULL,
            CoreError::RoomExists(_) => codes::ROOM_EXISTS,
            CoreError::RoomNotEmpty => codes::ROOM_NOT_EMPTY,
            CoreError::NotInRoom(_) => codes::NOT_IN_ROOM,
            CoreError::UserOffline(_) => codes::USER_OFFLINE,
            CoreError::MessageNotFound => codes::MESSAGE_NOT_FOUND,
            CoreError::Unauthorized => codes::UNAUTHORIZED,
            CoreError::TooManyConnections(_) => codes::TOO_MANY_CONNECTIONS,
            CoreError::Forbidden(_) => codes::FORBIDDEN,
            CoreError::Validation(_) => codes::VALIDATION_ERROR,
            CoreError::RateLimited { action, .. } => action.error_code(),
            CoreError::SpamBlocked { .. } => codes::SPAM_DETECTED,
            CoreError::DependencyUnavailable(_) => codes::SERVICE_UNAVAILABLE,
            CoreError::Internal(_) => codes::INTERNAL_ERROR,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            CoreError::RoomNotFound(_) | CoreError::UserOffline(_) | CoreError::MessageNotFound => {
                ErrorCategory::NotFound
            }
            CoreError::InvalidPassword
            | CoreError::RoomFull { .. }
            | CoreError::NotInRoom(_)
            | CoreError::Unauthorized
            | CoreError::TooManyConnections(_)
            | CoreError::Forbidden(_) => ErrorCategory::Forbidden,
            CoreError::RoomExists(_) | CoreError::RoomNotEmpty => ErrorCategory::Conflict,
            CoreError::Validation(_) => ErrorCategory::Validation,
            CoreError::RateLimited { .. } => ErrorCategory::RateLimited,
            CoreError::SpamBlocked { .. } => ErrorCategory::SpamBlocked,
            CoreError::DependencyUnavailable(_) => ErrorCategory::DependencyUnavailable,
            CoreError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Whether the failure concerns room state and should surface as a
    /// `room-error` rather than a generic `error`.
    pub fn is_room_error(&self) -> bool {
        matches!(
            self,
            CoreError::RoomNotFound(_)
                | CoreError::InvalidPassword
                | CoreError::RoomFull { .. }
                | CoreError::RoomExists(_)
                | CoreError::RoomNotEmpty
                | CoreError::NotInRoom(_)
        )
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Internal(format!("serialization: {err}"))
    }
}
