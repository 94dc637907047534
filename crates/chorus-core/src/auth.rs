use std::collections::HashMap;

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use async_trait::async_trait;
use chorus_models::user::Identity;

use crate::error::CoreError;

/// Seam to the external authentication service. Turns a presented
/// credential into a verified identity, or `None` if it is not recognised.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credential: &str) -> Result<Option<Identity>, CoreError>;
}

/// Fixed token -> identity table loaded from configuration.
#[derive(Debug, Default, Clone)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenAuthenticator {
    pub fn new(tokens: HashMap<String, Identity>) -> Self {
        Self { tokens }
    }

    pub fn with_token(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, credential: &str) -> Result<Option<Identity>, CoreError> {
        Ok(self.tokens.get(credential.trim()).cloned())
    }
}

pub fn hash_password(password: &str) -> Result<String, CoreError> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| CoreError::Internal(e.to_string()))
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool, CoreError> {
    let parsed = PasswordHash::new(hash).map_err(|e| CoreError::Internal(e.to_string()))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

/// Argon2 is CPU-bound; keep it off the async workers.
pub async fn hash_password_blocking(password: String) -> Result<String, CoreError> {
    tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|e| CoreError::Internal(format!("hash task failed: {e}")))?
}

pub async fn verify_password_blocking(password: String, hash: String) -> Result<bool, CoreError> {
    tokio::task::spawn_blocking(move || verify_password(&password, &hash))
        .await
        .map_err(|e| CoreError::Internal(format!("verify task failed: {e}")))?
}
