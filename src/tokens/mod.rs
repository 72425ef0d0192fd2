//! Refresh token lifecycle and access token revocation.
//!
//! Flow Overview:
//! 1) Login mints a refresh token in a fresh family.
//! 2) Each refresh revokes the presented token and mints its successor in the
//!    same family, atomically and only if the presented token was still live.
//! 3) Presenting an already revoked token (or losing the rotation race) is
//!    treated as theft: every live token in the family is revoked.
//! 4) Access tokens are short-lived JWTs; logout blacklists their `jti` until
//!    the natural expiry.

use chrono::Duration;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::{bounded_seconds, Clock, RandomSource};
use crate::store::{StoreError, TokenStore};

pub mod access;
pub mod model;
pub mod utils;

pub use access::{AccessClaims, AccessTokenError, AccessTokenIssuer};
pub use model::{BlacklistEntry, ClientInfo, RefreshTokenRecord, RevocationReason};

pub const DEFAULT_REFRESH_TTL_SECONDS: i64 = 30 * 24 * 60 * 60;
pub const DEFAULT_ACCESS_TTL_SECONDS: i64 = 15 * 60;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("refresh token not found")]
    NotFound,
    #[error("refresh token expired")]
    Expired,
    #[error("refresh token reused")]
    Reused,
    #[error("token store unavailable: {0}")]
    Store(#[from] StoreError),
    #[error("token generation failed: {0}")]
    Generation(String),
}

#[derive(Clone, Debug)]
pub struct TokenConfig {
    refresh_ttl_seconds: i64,
    access_ttl_seconds: i64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            refresh_ttl_seconds: DEFAULT_REFRESH_TTL_SECONDS,
            access_ttl_seconds: DEFAULT_ACCESS_TTL_SECONDS,
        }
    }
}

impl TokenConfig {
    #[must_use]
    pub fn with_refresh_ttl_seconds(mut self, seconds: i64) -> Self {
        self.refresh_ttl_seconds = bounded_seconds(seconds);
        self
    }

    #[must_use]
    pub fn with_access_ttl_seconds(mut self, seconds: i64) -> Self {
        self.access_ttl_seconds = bounded_seconds(seconds);
        self
    }

    #[must_use]
    pub fn refresh_ttl_seconds(&self) -> i64 {
        self.refresh_ttl_seconds
    }

    #[must_use]
    pub fn access_ttl_seconds(&self) -> i64 {
        self.access_ttl_seconds
    }
}

/// Rows removed by [`TokenManager::cleanup_expired`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TokenCleanup {
    pub refresh_tokens: u64,
    pub blacklist_entries: u64,
}

pub struct TokenManager {
    store: Arc<dyn TokenStore>,
    clock: Arc<dyn Clock>,
    random: Arc<dyn RandomSource>,
    config: TokenConfig,
}

impl TokenManager {
    #[must_use]
    pub fn new(
        store: Arc<dyn TokenStore>,
        clock: Arc<dyn Clock>,
        random: Arc<dyn RandomSource>,
        config: TokenConfig,
    ) -> Self {
        Self {
            store,
            clock,
            random,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    fn mint(
        &self,
        user_id: Uuid,
        tenant_id: Uuid,
        family_id: Uuid,
        client: &ClientInfo,
    ) -> Result<(String, RefreshTokenRecord), TokenError> {
        let raw = utils::generate_refresh_token(self.random.as_ref())
            .map_err(|err| TokenError::Generation(format!("{err:#}")))?;
        let now = self.clock.now();
        let record = RefreshTokenRecord {
            id: Uuid::new_v4(),
            token_hash: utils::hash_refresh_token(&raw),
            user_id,
            tenant_id,
            family_id,
            device_info: client.device_info.clone(),
            ip: client.ip.clone(),
            created_at: now,
            expires_at: now + Duration::seconds(self.config.refresh_ttl_seconds),
            revoked_at: None,
            revocation_reason: None,
            replaced_by: None,
        };
        Ok((raw, record))
    }

    /// Start a new session: fresh family, first token.
    ///
    /// # Errors
    /// Returns `TokenError::Store` if the record cannot be persisted.
    pub async fn issue_initial_token(
        &self,
        user_id: Uuid,
        tenant_id: Uuid,
        client: &ClientInfo,
    ) -> Result<(String, RefreshTokenRecord), TokenError> {
        let (raw, record) = self.mint(user_id, tenant_id, Uuid::new_v4(), client)?;
        self.store.insert_refresh_token(&record).await?;
        info!(
            user_id = %user_id,
            family_id = %record.family_id,
            "Issued refresh token for new session"
        );
        Ok((raw, record))
    }

    /// Exchange a refresh token for its successor in the same family.
    ///
    /// # Errors
    /// Returns `NotFound` for unknown tokens, `Reused` for revoked tokens (after
    /// revoking the whole family), `Expired` past expiry, or `Store` on storage failures.
    pub async fn rotate(
        &self,
        raw_token: &str,
        client: &ClientInfo,
    ) -> Result<(String, RefreshTokenRecord), TokenError> {
        let hash = utils::hash_refresh_token(raw_token);
        let Some(current) = self.store.find_refresh_token(&hash).await? else {
            return Err(TokenError::NotFound);
        };

        if current.is_revoked() {
            return Err(self.detect_reuse_and_revoke_family(&current).await);
        }
        if current.is_expired(self.clock.now()) {
            return Err(TokenError::Expired);
        }

        let client = ClientInfo::new(
            client.device_info.clone().or_else(|| current.device_info.clone()),
            client.ip.clone().or_else(|| current.ip.clone()),
        );
        let (raw, next) =
            self.mint(current.user_id, current.tenant_id, current.family_id, &client)?;
        let rotated = self
            .store
            .rotate_refresh_token(current.id, &next, self.clock.now())
            .await?;
        if !rotated {
            // Someone else consumed this token between our read and write.
            return Err(self.detect_reuse_and_revoke_family(&current).await);
        }
        Ok((raw, next))
    }

    /// Revoke every live token in the record's family after a replay.
    ///
    /// Returns `TokenError::Reused`, or `TokenError::Store` if the family could
    /// not be revoked.
    pub async fn detect_reuse_and_revoke_family(&self, record: &RefreshTokenRecord) -> TokenError {
        match self
            .store
            .revoke_family(record.family_id, self.clock.now(), RevocationReason::ReuseDetected)
            .await
        {
            Ok(revoked) => {
                warn!(
                    security_event = "refresh_token_reuse",
                    user_id = %record.user_id,
                    family_id = %record.family_id,
                    token_id = %record.id,
                    revoked,
                    "Refresh token reuse detected; revoked token family"
                );
                TokenError::Reused
            }
            Err(err) => {
                warn!(
                    security_event = "refresh_token_reuse",
                    user_id = %record.user_id,
                    family_id = %record.family_id,
                    "Refresh token reuse detected but family revocation failed: {err}"
                );
                TokenError::Store(err)
            }
        }
    }

    /// Revoke every live refresh token of a user (logout everywhere, password change).
    ///
    /// # Errors
    /// Returns `TokenError::Store` on storage failures.
    pub async fn revoke_all_for_user(
        &self,
        user_id: Uuid,
        reason: RevocationReason,
    ) -> Result<u64, TokenError> {
        let revoked = self
            .store
            .revoke_user_tokens(user_id, self.clock.now(), reason)
            .await?;
        info!(
            user_id = %user_id,
            revoked,
            reason = reason.as_str(),
            "Revoked all refresh tokens for user"
        );
        Ok(revoked)
    }

    /// Revoke the family of the presented token. Unknown tokens are a no-op.
    ///
    /// # Errors
    /// Returns `TokenError::Store` on storage failures.
    pub async fn revoke_session(&self, raw_token: &str) -> Result<u64, TokenError> {
        let hash = utils::hash_refresh_token(raw_token);
        let Some(record) = self.store.find_refresh_token(&hash).await? else {
            return Ok(0);
        };
        let revoked = self
            .store
            .revoke_family(record.family_id, self.clock.now(), RevocationReason::Logout)
            .await?;
        Ok(revoked)
    }

    /// Blacklist an access token until its natural expiry.
    ///
    /// # Errors
    /// Returns `TokenError::Store` on storage failures.
    pub async fn blacklist(
        &self,
        jti: &str,
        user_id: Uuid,
        natural_expiry: chrono::DateTime<chrono::Utc>,
        reason: RevocationReason,
    ) -> Result<(), TokenError> {
        let entry = BlacklistEntry {
            jti: jti.to_string(),
            user_id,
            expires_at: natural_expiry,
            reason,
            created_at: self.clock.now(),
        };
        self.store.insert_blacklist_entry(&entry).await?;
        Ok(())
    }

    /// # Errors
    /// Returns `TokenError::Store` on storage failures; callers must fail closed.
    pub async fn is_blacklisted(&self, jti: &str) -> Result<bool, TokenError> {
        Ok(self.store.blacklist_entry_exists(jti).await?)
    }

    /// Delete refresh tokens and blacklist entries past their natural expiry.
    ///
    /// # Errors
    /// Returns `TokenError::Store` on storage failures.
    pub async fn cleanup_expired(&self) -> Result<TokenCleanup, TokenError> {
        let now = self.clock.now();
        let refresh_tokens = self.store.delete_expired_refresh_tokens(now).await?;
        let blacklist_entries = self.store.delete_expired_blacklist_entries(now).await?;
        Ok(TokenCleanup {
            refresh_tokens,
            blacklist_entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, OsRandom};
    use crate::store::MemoryStore;
    use chrono::Utc;

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        manager: TokenManager,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let manager = TokenManager::new(
            store.clone(),
            clock.clone(),
            Arc::new(OsRandom),
            TokenConfig::default(),
        );
        Fixture {
            store,
            clock,
            manager,
        }
    }

    fn client() -> ClientInfo {
        ClientInfo::new(Some("firefox".to_string()), Some("198.51.100.7".to_string()))
    }

    async fn live_tokens(store: &MemoryStore, family_id: Uuid) -> usize {
        store
            .family_tokens(family_id)
            .await
            .unwrap()
            .iter()
            .filter(|record| !record.is_revoked())
            .count()
    }

    #[tokio::test]
    async fn rotation_keeps_the_family_and_links_tokens() {
        let fx = fixture();
        let (raw, first) = fx
            .manager
            .issue_initial_token(Uuid::new_v4(), Uuid::new_v4(), &client())
            .await
            .unwrap();
        let (next_raw, second) = fx.manager.rotate(&raw, &client()).await.unwrap();

        assert_ne!(raw, next_raw);
        assert_eq!(second.family_id, first.family_id);
        let family = fx.store.family_tokens(first.family_id).await.unwrap();
        assert_eq!(family[0].replaced_by, Some(second.id));
        assert_eq!(family[0].revocation_reason, Some(RevocationReason::Rotated));
        assert_eq!(live_tokens(&fx.store, first.family_id).await, 1);
    }

    #[tokio::test]
    async fn replaying_a_rotated_token_revokes_the_family() {
        let fx = fixture();
        let (raw, first) = fx
            .manager
            .issue_initial_token(Uuid::new_v4(), Uuid::new_v4(), &client())
            .await
            .unwrap();
        let (next_raw, _) = fx.manager.rotate(&raw, &client()).await.unwrap();

        let replay = fx.manager.rotate(&raw, &client()).await;
        assert!(matches!(replay, Err(TokenError::Reused)));
        assert_eq!(live_tokens(&fx.store, first.family_id).await, 0);

        // The legitimate successor is dead too.
        let successor = fx.manager.rotate(&next_raw, &client()).await;
        assert!(matches!(successor, Err(TokenError::Reused)));
    }

    #[tokio::test]
    async fn concurrent_rotation_has_one_winner() {
        let fx = fixture();
        let (raw, first) = fx
            .manager
            .issue_initial_token(Uuid::new_v4(), Uuid::new_v4(), &client())
            .await
            .unwrap();
        let (client_a, client_b) = (client(), client());
        let (a, b) = tokio::join!(
            fx.manager.rotate(&raw, &client_a),
            fx.manager.rotate(&raw, &client_b)
        );
        let wins = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(wins, 1);
        assert!(matches!(a, Err(TokenError::Reused)) || matches!(b, Err(TokenError::Reused)));
        assert_eq!(live_tokens(&fx.store, first.family_id).await, 0);
    }

    #[tokio::test]
    async fn unknown_and_expired_tokens_are_rejected() {
        let fx = fixture();
        assert!(matches!(
            fx.manager.rotate("nope", &client()).await,
            Err(TokenError::NotFound)
        ));

        let (raw, _) = fx
            .manager
            .issue_initial_token(Uuid::new_v4(), Uuid::new_v4(), &client())
            .await
            .unwrap();
        fx.clock
            .advance(Duration::seconds(DEFAULT_REFRESH_TTL_SECONDS));
        assert!(matches!(
            fx.manager.rotate(&raw, &client()).await,
            Err(TokenError::Expired)
        ));
    }

    #[tokio::test]
    async fn revoke_all_for_user_spans_families() {
        let fx = fixture();
        let user_id = Uuid::new_v4();
        let tenant_id = Uuid::new_v4();
        for _ in 0..3 {
            fx.manager
                .issue_initial_token(user_id, tenant_id, &client())
                .await
                .unwrap();
        }
        let revoked = fx
            .manager
            .revoke_all_for_user(user_id, RevocationReason::LogoutAll)
            .await
            .unwrap();
        assert_eq!(revoked, 3);
    }

    #[tokio::test]
    async fn revoke_session_ignores_unknown_tokens() {
        let fx = fixture();
        assert_eq!(fx.manager.revoke_session("missing").await.unwrap(), 0);
        let (raw, record) = fx
            .manager
            .issue_initial_token(Uuid::new_v4(), Uuid::new_v4(), &client())
            .await
            .unwrap();
        assert_eq!(fx.manager.revoke_session(&raw).await.unwrap(), 1);
        assert_eq!(live_tokens(&fx.store, record.family_id).await, 0);
    }

    #[tokio::test]
    async fn blacklist_entries_expire_with_cleanup() {
        let fx = fixture();
        let expiry = fx.clock.now() + Duration::minutes(15);
        fx.manager
            .blacklist("jti-1", Uuid::new_v4(), expiry, RevocationReason::Logout)
            .await
            .unwrap();
        fx.manager
            .blacklist("jti-1", Uuid::new_v4(), expiry, RevocationReason::Logout)
            .await
            .unwrap();
        assert!(fx.manager.is_blacklisted("jti-1").await.unwrap());

        fx.clock.advance(Duration::minutes(16));
        let cleanup = fx.manager.cleanup_expired().await.unwrap();
        assert_eq!(cleanup.blacklist_entries, 1);
        assert!(!fx.manager.is_blacklisted("jti-1").await.unwrap());
    }
}
