use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Role handed to the core by the authentication collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Guest,
    User,
    Moderator,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Guest => "guest",
            Role::User => "user",
            Role::Moderator => "moderator",
            Role::Admin => "admin",
        }
    }

    pub fn is_guest(self) -> bool {
        self == Role::Guest
    }

    /// Moderators and admins may act on other users' messages.
    pub fn can_moderate(self) -> bool {
        matches!(self, Role::Moderator | Role::Admin)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "guest" => Ok(Role::Guest),
            "user" => Ok(Role::User),
            "moderator" | "mod" => Ok(Role::Moderator),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// A verified user identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
    pub role: Role,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            role,
        }
    }

    pub fn is_guest(&self) -> bool {
        self.role.is_guest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parses_aliases() {
        assert_eq!("MOD".parse::<Role>().unwrap(), Role::Moderator);
        assert_eq!(" admin ".parse::<Role>().unwrap(), Role::Admin);
        assert!("owner".parse::<Role>().is_err());
    }

    #[test]
    fn only_moderators_and_admins_moderate() {
        assert!(!Role::Guest.can_moderate());
        assert!(!Role::User.can_moderate());
        assert!(Role::Moderator.can_moderate());
        assert!(Role::Admin.can_moderate());
    }
}
