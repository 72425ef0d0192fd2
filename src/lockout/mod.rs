//! Brute-force protection for the login endpoint.
//!
//! Flow Overview:
//! 1) Every login outcome is appended to `login_attempts`.
//! 2) After a failure, failures inside the rolling window are counted
//!    separately for the account identifier and the client IP.
//! 3) Crossing a threshold writes a lockout row whose duration doubles with
//!    each lockout the target collected in the last 24 hours.
//! 4) A lockout ends when `unlock_at` passes or an operator unlocks it.
//!
//! Whitelisted IPs are never IP-locked. A new IP lockout also counts as a
//! rate-limit violation so persistent offenders escalate into an auto-ban.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clock::{bounded_seconds, Clock};
use crate::rules::RuleBook;
use crate::store::{LockoutStore, StoreError};
use crate::users::normalize_identifier;

pub mod backoff;
pub mod model;

pub use model::{AttemptOutcome, Lockout, LockoutTarget, LoginAttempt};

pub const LOGIN_VIOLATION_ENDPOINT: &str = "auth:login";

const DEFAULT_WINDOW_SECONDS: i64 = 15 * 60;
const DEFAULT_ACCOUNT_THRESHOLD: u32 = 5;
const DEFAULT_IP_THRESHOLD: u32 = 10;
const DEFAULT_ACCOUNT_BASE_SECONDS: i64 = 30 * 60;
const DEFAULT_IP_BASE_SECONDS: i64 = 60 * 60;
const DEFAULT_MAX_LOCKOUT_SECONDS: i64 = 24 * 60 * 60;
const DEFAULT_EXPONENT_CAP: u32 = 6;
const DEFAULT_HISTORY_SECONDS: i64 = 24 * 60 * 60;

#[derive(Clone, Debug)]
pub struct LockoutConfig {
    window_seconds: i64,
    account_threshold: u32,
    ip_threshold: u32,
    account_base_seconds: i64,
    ip_base_seconds: i64,
    max_lockout_seconds: i64,
    exponent_cap: u32,
    history_seconds: i64,
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            window_seconds: DEFAULT_WINDOW_SECONDS,
            account_threshold: DEFAULT_ACCOUNT_THRESHOLD,
            ip_threshold: DEFAULT_IP_THRESHOLD,
            account_base_seconds: DEFAULT_ACCOUNT_BASE_SECONDS,
            ip_base_seconds: DEFAULT_IP_BASE_SECONDS,
            max_lockout_seconds: DEFAULT_MAX_LOCKOUT_SECONDS,
            exponent_cap: DEFAULT_EXPONENT_CAP,
            history_seconds: DEFAULT_HISTORY_SECONDS,
        }
    }
}

impl LockoutConfig {
    #[must_use]
    pub fn with_window_seconds(mut self, seconds: i64) -> Self {
        self.window_seconds = bounded_seconds(seconds);
        self
    }

    #[must_use]
    pub fn with_account_threshold(mut self, threshold: u32) -> Self {
        self.account_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_ip_threshold(mut self, threshold: u32) -> Self {
        self.ip_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_account_base_seconds(mut self, seconds: i64) -> Self {
        self.account_base_seconds = bounded_seconds(seconds);
        self
    }

    #[must_use]
    pub fn with_ip_base_seconds(mut self, seconds: i64) -> Self {
        self.ip_base_seconds = bounded_seconds(seconds);
        self
    }

    #[must_use]
    pub fn with_max_lockout_seconds(mut self, seconds: i64) -> Self {
        self.max_lockout_seconds = bounded_seconds(seconds);
        self
    }

    #[must_use]
    pub fn with_exponent_cap(mut self, cap: u32) -> Self {
        self.exponent_cap = cap;
        self
    }

    #[must_use]
    pub fn window_seconds(&self) -> i64 {
        self.window_seconds
    }

    #[must_use]
    pub fn account_threshold(&self) -> u32 {
        self.account_threshold
    }

    #[must_use]
    pub fn ip_threshold(&self) -> u32 {
        self.ip_threshold
    }

    fn threshold(&self, target: &LockoutTarget) -> u32 {
        match target {
            LockoutTarget::Account(_) => self.account_threshold,
            LockoutTarget::Ip(_) => self.ip_threshold,
        }
    }

    fn base(&self, target: &LockoutTarget) -> Duration {
        match target {
            LockoutTarget::Account(_) => Duration::seconds(self.account_base_seconds),
            LockoutTarget::Ip(_) => Duration::seconds(self.ip_base_seconds),
        }
    }
}

/// An active lockout with the numbers the gateway renders.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockoutInfo {
    pub lockout: Lockout,
    pub minutes_remaining: i64,
    pub retry_after_seconds: u64,
}

impl LockoutInfo {
    fn new(lockout: Lockout, now: DateTime<Utc>) -> Self {
        let retry_after_seconds = u64::try_from(lockout.remaining(now).num_seconds()).unwrap_or(0);
        Self {
            minutes_remaining: lockout.minutes_remaining(now),
            retry_after_seconds,
            lockout,
        }
    }
}

/// Result of [`LockoutEngine::check_and_apply_lockout`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LockoutOutcome {
    pub account_locked_now: bool,
    pub ip_locked_now: bool,
    pub account: Option<LockoutInfo>,
    pub ip: Option<LockoutInfo>,
}

impl LockoutOutcome {
    #[must_use]
    pub fn was_just_locked(&self) -> bool {
        self.account_locked_now || self.ip_locked_now
    }

    /// The lockout that ends last, for "try again in N minutes".
    #[must_use]
    pub fn longest(&self) -> Option<&LockoutInfo> {
        [self.account.as_ref(), self.ip.as_ref()]
            .into_iter()
            .flatten()
            .max_by_key(|info| info.lockout.unlock_at)
    }
}

/// Rows removed by [`LockoutEngine::cleanup_old_records`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LockoutCleanup {
    pub attempts: u64,
    pub lockouts: u64,
}

pub struct LockoutEngine {
    store: Arc<dyn LockoutStore>,
    rules: Arc<RuleBook>,
    clock: Arc<dyn Clock>,
    config: LockoutConfig,
}

impl LockoutEngine {
    #[must_use]
    pub fn new(
        store: Arc<dyn LockoutStore>,
        rules: Arc<RuleBook>,
        clock: Arc<dyn Clock>,
        config: LockoutConfig,
    ) -> Self {
        Self {
            store,
            rules,
            clock,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &LockoutConfig {
        &self.config
    }

    /// Append a login outcome. The identifier is stored normalized.
    ///
    /// # Errors
    /// Returns the store error if the attempt cannot be written.
    pub async fn record_attempt(
        &self,
        identifier: &str,
        ip: Option<&str>,
        outcome: AttemptOutcome,
        reason: Option<&str>,
    ) -> Result<(), StoreError> {
        let attempt = LoginAttempt {
            id: Uuid::new_v4(),
            identifier: normalize_identifier(identifier),
            ip: ip.map(str::to_string),
            outcome,
            reason: reason.map(str::to_string),
            attempted_at: self.clock.now(),
        };
        self.store.append_attempt(&attempt).await
    }

    /// # Errors
    /// Returns the store error if the lockout table cannot be read.
    pub async fn is_locked(&self, identifier: &str) -> Result<bool, StoreError> {
        Ok(self.account_lockout(identifier).await?.is_some())
    }

    /// # Errors
    /// Returns the store error if the lockout table cannot be read.
    pub async fn is_ip_locked(&self, ip: &str) -> Result<bool, StoreError> {
        Ok(self.ip_lockout(ip).await?.is_some())
    }

    /// # Errors
    /// Returns the store error if the lockout table cannot be read.
    pub async fn account_lockout(
        &self,
        identifier: &str,
    ) -> Result<Option<LockoutInfo>, StoreError> {
        self.active(&LockoutTarget::Account(normalize_identifier(identifier)))
            .await
    }

    /// # Errors
    /// Returns the store error if the lockout table cannot be read.
    pub async fn ip_lockout(&self, ip: &str) -> Result<Option<LockoutInfo>, StoreError> {
        self.active(&LockoutTarget::Ip(ip.to_string())).await
    }

    async fn active(&self, target: &LockoutTarget) -> Result<Option<LockoutInfo>, StoreError> {
        let now = self.clock.now();
        Ok(self
            .store
            .active_lockout(target, now)
            .await?
            .map(|lockout| LockoutInfo::new(lockout, now)))
    }

    /// Evaluate both thresholds after a failed login and lock what crossed them.
    ///
    /// # Errors
    /// Returns the store error if attempts or lockouts cannot be read or written.
    pub async fn check_and_apply_lockout(
        &self,
        identifier: &str,
        ip: Option<&str>,
    ) -> Result<LockoutOutcome, StoreError> {
        let mut outcome = LockoutOutcome::default();

        let account = LockoutTarget::Account(normalize_identifier(identifier));
        let (locked_now, info) = self.apply(&account).await?;
        outcome.account_locked_now = locked_now;
        outcome.account = info;

        if let Some(ip) = ip {
            if self.ip_exempt(ip).await {
                return Ok(outcome);
            }
            let target = LockoutTarget::Ip(ip.to_string());
            let (locked_now, info) = self.apply(&target).await?;
            outcome.ip_locked_now = locked_now;
            outcome.ip = info;
            if locked_now {
                if let Err(err) = self
                    .rules
                    .record_violation(ip, LOGIN_VIOLATION_ENDPOINT)
                    .await
                {
                    error!("Failed to record login violation for {ip}: {err}");
                }
            }
        }

        Ok(outcome)
    }

    async fn ip_exempt(&self, ip: &str) -> bool {
        match self.rules.is_whitelisted(ip).await {
            Ok(whitelisted) => whitelisted,
            Err(err) => {
                error!("Whitelist lookup failed for {ip}, applying IP lockout rules: {err}");
                false
            }
        }
    }

    async fn apply(
        &self,
        target: &LockoutTarget,
    ) -> Result<(bool, Option<LockoutInfo>), StoreError> {
        let now = self.clock.now();
        if let Some(active) = self.store.active_lockout(target, now).await? {
            return Ok((false, Some(LockoutInfo::new(active, now))));
        }

        // Failures from before the previous lockout (or its manual unlock) are settled.
        let mut since = now - Duration::seconds(self.config.window_seconds);
        if let Some(previous) = self.store.latest_lockout(target).await? {
            since = since.max(previous.manual_unlock_at.unwrap_or(previous.locked_at));
        }
        let failures = self.store.count_failures_since(target, since).await?;
        let threshold = self.config.threshold(target);
        if failures < u64::from(threshold) {
            return Ok((false, None));
        }

        let prior = self
            .store
            .count_lockouts_since(target, now - Duration::seconds(self.config.history_seconds))
            .await?;
        let duration = backoff::lockout_duration(
            self.config.base(target),
            prior,
            self.config.exponent_cap,
            Duration::seconds(self.config.max_lockout_seconds),
        );
        let lockout = Lockout {
            id: Uuid::new_v4(),
            target: target.clone(),
            failed_count: u32::try_from(failures).unwrap_or(u32::MAX),
            locked_at: now,
            unlock_at: now + duration,
            reason: format!("{failures} failed login attempts"),
            manual_unlock_at: None,
            unlocked_by: None,
        };

        if self.store.insert_lockout_if_unlocked(&lockout, now).await? {
            warn!(
                security_event = "lockout",
                target = target.kind(),
                subject = target.value(),
                failures,
                prior_lockouts = prior,
                unlock_at = %lockout.unlock_at,
                "Lockout applied"
            );
            return Ok((true, Some(LockoutInfo::new(lockout, now))));
        }

        // A concurrent request created the lockout first.
        Ok((false, self.active(target).await?))
    }

    /// # Errors
    /// Returns the store error if the lockout cannot be closed.
    pub async fn unlock_account(
        &self,
        identifier: &str,
        unlocked_by: &str,
    ) -> Result<u64, StoreError> {
        let target = LockoutTarget::Account(normalize_identifier(identifier));
        self.unlock(&target, unlocked_by).await
    }

    /// # Errors
    /// Returns the store error if the lockout cannot be closed.
    pub async fn unlock_ip(&self, ip: &str, unlocked_by: &str) -> Result<u64, StoreError> {
        self.unlock(&LockoutTarget::Ip(ip.to_string()), unlocked_by).await
    }

    async fn unlock(&self, target: &LockoutTarget, unlocked_by: &str) -> Result<u64, StoreError> {
        let unlocked = self
            .store
            .manual_unlock(target, self.clock.now(), unlocked_by)
            .await?;
        info!(
            target = target.kind(),
            subject = target.value(),
            unlocked_by,
            unlocked,
            "Manual unlock"
        );
        Ok(unlocked)
    }

    /// Prune attempts and closed lockouts older than the retention period.
    ///
    /// # Errors
    /// Returns the store error if the deletes fail.
    pub async fn cleanup_old_records(
        &self,
        retention_days: u32,
    ) -> Result<LockoutCleanup, StoreError> {
        let now = self.clock.now();
        let before = now - Duration::days(i64::from(retention_days));
        let attempts = self.store.delete_attempts_before(before).await?;
        let lockouts = self.store.delete_closed_lockouts_before(before, now).await?;
        Ok(LockoutCleanup { attempts, lockouts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::rules::{EscalationConfig, NewIpRule, RuleKind};
    use crate::store::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        rules: Arc<RuleBook>,
        engine: LockoutEngine,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let rules = Arc::new(RuleBook::new(
            store.clone(),
            clock.clone(),
            EscalationConfig::default().with_cache_ttl(std::time::Duration::ZERO),
        ));
        let engine = LockoutEngine::new(
            store.clone(),
            rules.clone(),
            clock.clone(),
            LockoutConfig::default(),
        );
        Fixture {
            store,
            clock,
            rules,
            engine,
        }
    }

    async fn fail(fx: &Fixture, identifier: &str, ip: &str) -> LockoutOutcome {
        fx.engine
            .record_attempt(identifier, Some(ip), AttemptOutcome::Failure, Some("bad_password"))
            .await
            .unwrap();
        fx.engine
            .check_and_apply_lockout(identifier, Some(ip))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn fifth_failure_locks_the_account() {
        let fx = fixture();
        for _ in 0..4 {
            assert!(!fail(&fx, "a@x.com", "198.51.100.1").await.was_just_locked());
        }
        let outcome = fail(&fx, "A@X.com ", "198.51.100.1").await;
        assert!(outcome.account_locked_now);
        assert!(!outcome.ip_locked_now);
        let info = outcome.account.unwrap();
        assert_eq!(info.lockout.unlock_at, fx.clock.now() + Duration::minutes(30));
        assert_eq!(info.minutes_remaining, 30);
        assert!(fx.engine.is_locked("a@x.com").await.unwrap());
    }

    #[tokio::test]
    async fn eleven_failures_lock_account_and_ip() {
        let fx = fixture();
        let mut account_locks = 0;
        let mut last = LockoutOutcome::default();
        for _ in 0..11 {
            last = fail(&fx, "a@x.com", "198.51.100.2").await;
            if last.account_locked_now {
                account_locks += 1;
            }
        }
        assert_eq!(account_locks, 1);
        let now = fx.clock.now();
        assert_eq!(
            last.account.unwrap().lockout.unlock_at,
            now + Duration::minutes(30)
        );
        assert!(fx.engine.is_ip_locked("198.51.100.2").await.unwrap());
        let ip = fx.engine.ip_lockout("198.51.100.2").await.unwrap().unwrap();
        assert_eq!(ip.lockout.unlock_at, now + Duration::hours(1));
        assert_eq!(
            fx.store
                .lockout_history(&LockoutTarget::Account("a@x.com".to_string()))
                .len(),
            1
        );
        let violation = fx.store.violation("198.51.100.2", LOGIN_VIOLATION_ENDPOINT).unwrap();
        assert_eq!(violation.count, 1);
    }

    #[tokio::test]
    async fn lock_stays_until_unlock_at() {
        let fx = fixture();
        for _ in 0..5 {
            fail(&fx, "a@x.com", "198.51.100.3").await;
        }
        fx.clock.advance(Duration::minutes(29));
        assert!(fx.engine.is_locked("a@x.com").await.unwrap());
        fx.clock.advance(Duration::minutes(1));
        assert!(!fx.engine.is_locked("a@x.com").await.unwrap());
    }

    #[tokio::test]
    async fn repeat_lockouts_back_off_exponentially() {
        let fx = fixture();
        for _ in 0..5 {
            fail(&fx, "a@x.com", "198.51.100.4").await;
        }
        fx.clock.advance(Duration::minutes(31));
        let mut outcome = LockoutOutcome::default();
        for _ in 0..5 {
            outcome = fail(&fx, "a@x.com", "198.51.100.4").await;
        }
        assert!(outcome.account_locked_now);
        let info = outcome.account.unwrap();
        assert_eq!(info.lockout.unlock_at - info.lockout.locked_at, Duration::hours(1));
    }

    #[tokio::test]
    async fn manual_unlock_clears_the_lock_and_the_failure_count() {
        let fx = fixture();
        for _ in 0..5 {
            fail(&fx, "a@x.com", "198.51.100.5").await;
        }
        fx.clock.advance(Duration::seconds(1));
        assert_eq!(fx.engine.unlock_account("a@x.com", "admin@x.com").await.unwrap(), 1);
        assert!(!fx.engine.is_locked("a@x.com").await.unwrap());

        fx.clock.advance(Duration::seconds(1));
        let outcome = fail(&fx, "a@x.com", "198.51.100.5").await;
        assert!(!outcome.account_locked_now);
        assert!(!fx.engine.is_locked("a@x.com").await.unwrap());
    }

    #[tokio::test]
    async fn whitelisted_ips_are_never_locked() {
        let fx = fixture();
        fx.rules
            .upsert(&NewIpRule::new("10.0.0.5", RuleKind::Whitelist, "office"))
            .await
            .unwrap();
        for i in 0..12 {
            fail(&fx, &format!("user{i}@x.com"), "10.0.0.5").await;
        }
        assert!(!fx.engine.is_ip_locked("10.0.0.5").await.unwrap());
    }

    #[tokio::test]
    async fn cleanup_keeps_active_lockouts() {
        let fx = fixture();
        for _ in 0..5 {
            fail(&fx, "a@x.com", "198.51.100.6").await;
        }
        fx.clock.advance(Duration::days(31));
        for _ in 0..5 {
            fail(&fx, "b@x.com", "198.51.100.7").await;
        }
        let cleanup = fx.engine.cleanup_old_records(30).await.unwrap();
        assert_eq!(cleanup.attempts, 5);
        assert_eq!(cleanup.lockouts, 1);
        assert!(fx.engine.is_locked("b@x.com").await.unwrap());
        assert_eq!(fx.store.attempt_count(), 5);
    }

    #[tokio::test]
    async fn oversized_durations_are_capped() {
        let fx = fixture();
        let engine = LockoutEngine::new(
            fx.store.clone(),
            fx.rules.clone(),
            fx.clock.clone(),
            LockoutConfig::default()
                .with_window_seconds(i64::MAX)
                .with_account_base_seconds(i64::MAX)
                .with_max_lockout_seconds(i64::MAX),
        );
        for _ in 0..5 {
            engine
                .record_attempt("a@x.com", None, AttemptOutcome::Failure, None)
                .await
                .unwrap();
        }
        let outcome = engine.check_and_apply_lockout("a@x.com", None).await.unwrap();
        let info = outcome.account.unwrap();
        assert_eq!(
            info.lockout.unlock_at,
            fx.clock.now() + Duration::seconds(crate::clock::MAX_DURATION_SECONDS)
        );
    }
}
