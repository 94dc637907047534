use thiserror::Error;

pub const MAX_ROOM_ID_LEN: usize = 50;
pub const MAX_ROOM_NAME_LEN: usize = 100;
pub const MAX_DESCRIPTION_LEN: usize = 500;
pub const MAX_ROOM_PASSWORD_LEN: usize = 128;
pub const DEFAULT_MAX_MESSAGE_CHARS: usize = 500;

/// Room identifiers that would collide with routes or read as system actors.
const RESERVED_ROOM_IDS: &[&str] = &[
    "admin",
    "api",
    "system",
    "root",
    "moderator",
    "null",
    "undefined",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} is too short (min {min}, got {got})")]
    TooShort {
        field: &'static str,
        min: usize,
        got: usize,
    },
    #[error("{field} is too long (max {max}, got {got})")]
    TooLong {
        field: &'static str,
        max: usize,
        got: usize,
    },
    #[error("{0} contains invalid characters")]
    InvalidCharacters(&'static str),
    #[error("'{0}' is a reserved name")]
    ReservedName(String),
    #[error("{field} must be between {min} and {max} (got {got})")]
    OutOfRange {
        field: &'static str,
        min: u64,
        max: u64,
        got: u64,
    },
    #[error("{0}")]
    InvalidFormat(String),
}

pub fn validate_room_id(id: &str) -> Result<(), ValidationError> {
    let len = id.chars().count();
    if len < 1 {
        return Err(ValidationError::TooShort {
            field: "roomId",
            min: 1,
            got: len,
        });
    }
    if len > MAX_ROOM_ID_LEN {
        return Err(ValidationError::TooLong {
            field: "roomId",
            max: MAX_ROOM_ID_LEN,
            got: len,
        });
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ValidationError::InvalidCharacters("roomId"));
    }
    if RESERVED_ROOM_IDS
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(id))
    {
        return Err(ValidationError::ReservedName(id.to_string()));
    }
    Ok(())
}

pub fn validate_room_name(name: &str) -> Result<(), ValidationError> {
    let len = name.trim().chars().count();
    if len < 1 {
        return Err(ValidationError::TooShort {
            field: "name",
            min: 1,
            got: len,
        });
    }
    if len > MAX_ROOM_NAME_LEN {
        return Err(ValidationError::TooLong {
            field: "name",
            max: MAX_ROOM_NAME_LEN,
            got: len,
        });
    }
    Ok(())
}

pub fn validate_room_description(description: &str) -> Result<(), ValidationError> {
    let len = description.chars().count();
    if len > MAX_DESCRIPTION_LEN {
        return Err(ValidationError::TooLong {
            field: "description",
            max: MAX_DESCRIPTION_LEN,
            got: len,
        });
    }
    Ok(())
}

/// Private rooms must carry a non-empty password.
pub fn validate_room_password(password: Option<&str>, is_private: bool) -> Result<(), ValidationError> {
    match password {
        None if is_private => Err(ValidationError::InvalidFormat(
            "private rooms require a password".to_string(),
        )),
        None => Ok(()),
        Some(pw) => {
            let len = pw.chars().count();
            if is_private && pw.trim().is_empty() {
                return Err(ValidationError::TooShort {
                    field: "password",
                    min: 1,
                    got: 0,
                });
            }
            if len > MAX_ROOM_PASSWORD_LEN {
                return Err(ValidationError::TooLong {
                    field: "password",
                    max: MAX_ROOM_PASSWORD_LEN,
                    got: len,
                });
            }
            Ok(())
        }
    }
}

pub fn validate_capacity(capacity: u32, min: u32, max: u32) -> Result<(), ValidationError> {
    if capacity < min || capacity > max {
        return Err(ValidationError::OutOfRange {
            field: "capacity",
            min: min as u64,
            max: max as u64,
            got: capacity as u64,
        });
    }
    Ok(())
}

/// Message bodies are counted in characters, not bytes.
pub fn validate_message_content(content: &str, max_chars: usize) -> Result<(), ValidationError> {
    if content.trim().is_empty() {
        return Err(ValidationError::TooShort {
            field: "content",
            min: 1,
            got: 0,
        });
    }
    let len = content.chars().count();
    if len > max_chars {
        return Err(ValidationError::TooLong {
            field: "content",
            max: max_chars,
            got: len,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_ids_allow_url_safe_tokens() {
        assert!(validate_room_id("lobby").is_ok());
        assert!(validate_room_id("team_42-dev").is_ok());
        assert!(validate_room_id(&"a".repeat(50)).is_ok());
    }

    #[test]
    fn room_ids_reject_bad_input() {
        assert!(matches!(validate_room_id(""), Err(ValidationError::TooShort { .. })));
        assert!(matches!(
            validate_room_id(&"a".repeat(51)),
            Err(ValidationError::TooLong { .. })
        ));
        assert_eq!(
            validate_room_id("no spaces"),
            Err(ValidationError::InvalidCharacters("roomId"))
        );
        assert!(matches!(
            validate_room_id("Admin"),
            Err(ValidationError::ReservedName(_))
        ));
    }

    #[test]
    fn private_rooms_need_password() {
        assert!(validate_room_password(None, true).is_err());
        assert!(validate_room_password(Some("   "), true).is_err());
        assert!(validate_room_password(Some("pw1234"), true).is_ok());
        assert!(validate_room_password(None, false).is_ok());
    }

    #[test]
    fn capacity_bounds_are_inclusive() {
        assert!(validate_capacity(2, 2, 1000).is_ok());
        assert!(validate_capacity(1000, 2, 1000).is_ok());
        assert!(validate_capacity(1, 2, 1000).is_err());
        assert!(validate_capacity(1001, 2, 1000).is_err());
    }

    #[test]
    fn message_length_counts_chars() {
        assert!(validate_message_content("  ", 500).is_err());
        assert!(validate_message_content(&"é".repeat(500), 500).is_ok());
        assert!(validate_message_content(&"x".repeat(501), 500).is_err());
    }
}
