//! Read-only view of the identity owner's users.
//!
//! Accounts are created elsewhere; this service only resolves identifiers and
//! checks passwords. The bundled stores verify Argon2id PHC strings.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::{Mutex, PoisonError};
use tracing::debug;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::store::StoreError;

pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_USER: &str = "user";

/// Checked in place of a real hash when an identifier matches no user.
static DUMMY_HASH: Lazy<Option<String>> =
    Lazy::new(|| hash_password("bulwark-unknown-user", Params::default()).ok());

#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
pub struct User {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub identifier: String,
    pub role: String,
    pub active: bool,
}

impl User {
    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.role == ROLE_ADMIN
    }
}

/// Lowercase and trim an email-style identifier.
#[must_use]
pub fn normalize_identifier(identifier: &str) -> String {
    identifier.trim().to_lowercase()
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError>;

    /// Resolve a normalized identifier to an active user.
    async fn get_active_by_identifier(&self, identifier: &str)
        -> Result<Option<User>, StoreError>;

    async fn verify_password(&self, user: &User, password: &str) -> Result<bool, StoreError>;
}

/// Hash a password into an Argon2id PHC string.
///
/// # Errors
/// Returns an error if the parameters are invalid or hashing fails.
pub fn hash_password(password: &str, params: Params) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| anyhow::anyhow!("failed to hash password: {err}"))?;
    Ok(hash.to_string())
}

/// Check a password against a stored PHC string. Parameters come from the hash.
///
/// # Errors
/// Returns an error if the stored hash cannot be parsed.
pub fn verify_password_hash(password: &str, phc: &str) -> anyhow::Result<bool> {
    let parsed =
        PasswordHash::new(phc).map_err(|err| anyhow::anyhow!("invalid password hash: {err}"))?;
    match Argon2::default().verify_password(password.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(err) => Err(anyhow::anyhow!("failed to verify password: {err}")),
    }
}

/// Spend one Argon2 verification on an identifier that matched no user, so a
/// miss costs as much as a wrong password.
pub async fn verify_dummy_password(password: &str) {
    let password = password.to_string();
    let verified = tokio::task::spawn_blocking(move || {
        DUMMY_HASH
            .as_deref()
            .map(|phc| verify_password_hash(&password, phc))
    })
    .await;
    if let Ok(Some(Err(err))) = verified {
        debug!("Dummy password verification failed: {err}");
    }
}

/// In-process users for tests and local development.
#[derive(Debug, Default)]
pub struct MemoryUserStore {
    users: Mutex<Vec<(User, String)>>,
}

impl MemoryUserStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a user with a cheaply hashed password.
    ///
    /// # Errors
    /// Returns an error if hashing fails.
    pub fn add_user(
        &self,
        tenant_id: Uuid,
        identifier: &str,
        password: &str,
        role: &str,
    ) -> anyhow::Result<User> {
        // Minimal cost so test suites stay fast; production hashes come from the identity owner.
        let params = Params::new(1024, 1, 1, None)
            .map_err(|err| anyhow::anyhow!("invalid argon2 params: {err}"))?;
        let hash = hash_password(password, params)?;
        let user = User {
            id: Uuid::new_v4(),
            tenant_id,
            identifier: normalize_identifier(identifier),
            role: role.to_string(),
            active: true,
        };
        self.users
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((user.clone(), hash));
        Ok(user)
    }

    pub fn deactivate(&self, id: Uuid) {
        let mut users = self.users.lock().unwrap_or_else(PoisonError::into_inner);
        for (user, _) in users.iter_mut() {
            if user.id == id {
                user.active = false;
            }
        }
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let users = self.users.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(users
            .iter()
            .find(|(user, _)| user.id == id)
            .map(|(user, _)| user.clone()))
    }

    async fn get_active_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<Option<User>, StoreError> {
        let users = self.users.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(users
            .iter()
            .find(|(user, _)| user.active && user.identifier == identifier)
            .map(|(user, _)| user.clone()))
    }

    async fn verify_password(&self, user: &User, password: &str) -> Result<bool, StoreError> {
        let hash = {
            let users = self.users.lock().unwrap_or_else(PoisonError::into_inner);
            users
                .iter()
                .find(|(candidate, _)| candidate.id == user.id)
                .map(|(_, hash)| hash.clone())
        };
        let Some(hash) = hash else {
            return Ok(false);
        };
        verify_password_hash(password, &hash)
            .map_err(|err| StoreError::Unavailable(err.to_string()))
    }
}
