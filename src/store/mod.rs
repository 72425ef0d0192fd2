//! Durable storage seams for tokens, lockouts and IP rules.
//!
//! The components only talk to these traits. `postgres` is the production
//! backend; `memory` backs tests and local development with the same
//! atomicity guarantees (rotation compare-and-swap, conditional lockout insert).

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::future::Future;
use uuid::Uuid;

use crate::lockout::model::{Lockout, LockoutTarget, LoginAttempt};
use crate::rules::{IpRule, NewIpRule, RateLimitViolation, RuleKind};
use crate::tokens::model::{BlacklistEntry, RefreshTokenRecord, RevocationReason};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store call timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Run a store future with an upper bound on how long it may take.
///
/// # Errors
/// Returns `StoreError::Timeout` when the deadline passes, or the future's own error.
pub async fn bounded<T, F>(timeout: std::time::Duration, future: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(timeout)),
    }
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn insert_refresh_token(&self, record: &RefreshTokenRecord) -> Result<(), StoreError>;

    async fn find_refresh_token(
        &self,
        token_hash: &[u8],
    ) -> Result<Option<RefreshTokenRecord>, StoreError>;

    /// Revoke `old_id` in favour of `replacement` and persist the replacement.
    ///
    /// Both writes happen atomically and only if `old_id` is still unrevoked.
    /// Returns `false` when another caller consumed the token first.
    async fn rotate_refresh_token(
        &self,
        old_id: Uuid,
        replacement: &RefreshTokenRecord,
        revoked_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn revoke_family(
        &self,
        family_id: Uuid,
        revoked_at: DateTime<Utc>,
        reason: RevocationReason,
    ) -> Result<u64, StoreError>;

    async fn revoke_user_tokens(
        &self,
        user_id: Uuid,
        revoked_at: DateTime<Utc>,
        reason: RevocationReason,
    ) -> Result<u64, StoreError>;

    async fn family_tokens(&self, family_id: Uuid) -> Result<Vec<RefreshTokenRecord>, StoreError>;

    async fn delete_expired_refresh_tokens(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Inserting an already blacklisted jti is a no-op.
    async fn insert_blacklist_entry(&self, entry: &BlacklistEntry) -> Result<(), StoreError>;

    async fn blacklist_entry_exists(&self, jti: &str) -> Result<bool, StoreError>;

    async fn delete_expired_blacklist_entries(&self, now: DateTime<Utc>)
        -> Result<u64, StoreError>;
}

#[async_trait]
pub trait LockoutStore: Send + Sync {
    async fn append_attempt(&self, attempt: &LoginAttempt) -> Result<(), StoreError>;

    /// Failed attempts for the target recorded at or after `since`.
    async fn count_failures_since(
        &self,
        target: &LockoutTarget,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Most recent lockout that is neither expired nor manually closed.
    async fn active_lockout(
        &self,
        target: &LockoutTarget,
        now: DateTime<Utc>,
    ) -> Result<Option<Lockout>, StoreError>;

    /// Most recent lockout regardless of state.
    async fn latest_lockout(&self, target: &LockoutTarget) -> Result<Option<Lockout>, StoreError>;

    async fn count_lockouts_since(
        &self,
        target: &LockoutTarget,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Insert `lockout` unless the target already has an active one.
    /// Returns whether a row was written.
    async fn insert_lockout_if_unlocked(
        &self,
        lockout: &Lockout,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn manual_unlock(
        &self,
        target: &LockoutTarget,
        at: DateTime<Utc>,
        actor: &str,
    ) -> Result<u64, StoreError>;

    async fn delete_attempts_before(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Delete lockouts locked before `before` that are no longer active at `now`.
    async fn delete_closed_lockouts_before(
        &self,
        before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn active_rule(
        &self,
        ip: &str,
        kind: RuleKind,
        now: DateTime<Utc>,
    ) -> Result<Option<IpRule>, StoreError>;

    /// Create the rule, or refresh reason/expiry of the active rule of the same kind.
    async fn upsert_rule(&self, rule: &NewIpRule, now: DateTime<Utc>)
        -> Result<IpRule, StoreError>;

    async fn deactivate_rule(
        &self,
        ip: &str,
        kind: RuleKind,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn list_rules(
        &self,
        kind: Option<RuleKind>,
        now: DateTime<Utc>,
    ) -> Result<Vec<IpRule>, StoreError>;

    /// Bump the violation counter. A counter idle for longer than `horizon`
    /// starts over at 1.
    async fn record_violation(
        &self,
        ip: &str,
        endpoint: &str,
        now: DateTime<Utc>,
        horizon: Duration,
    ) -> Result<RateLimitViolation, StoreError>;

    async fn mark_violation_banned(&self, ip: &str, endpoint: &str) -> Result<(), StoreError>;

    async fn deactivate_expired_rules(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn delete_stale_violations(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;
}
