//! Cached access to IP rules plus violation escalation.
//!
//! Both the gateway policy and the lockout engine record violations here, so
//! an IP that keeps tripping either path ends up auto-banned.

use chrono::Duration;
use std::sync::Arc;
use tracing::warn;

use super::{BanTrigger, IpRule, NewIpRule, RateLimitViolation, RuleKind};
use crate::cache::{cache_aside, TtlCache, DEFAULT_CACHE_TTL};
use crate::clock::{bounded_seconds, Clock};
use crate::store::{RuleStore, StoreError};

pub const DEFAULT_VIOLATION_HORIZON_SECONDS: i64 = 60 * 60;
pub const DEFAULT_ESCALATION_THRESHOLD: u32 = 10;
pub const DEFAULT_BAN_SECONDS: i64 = 24 * 60 * 60;

#[derive(Clone, Debug)]
pub struct EscalationConfig {
    violation_horizon_seconds: i64,
    threshold: u32,
    ban_seconds: i64,
    cache_ttl: std::time::Duration,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            violation_horizon_seconds: DEFAULT_VIOLATION_HORIZON_SECONDS,
            threshold: DEFAULT_ESCALATION_THRESHOLD,
            ban_seconds: DEFAULT_BAN_SECONDS,
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }
}

impl EscalationConfig {
    #[must_use]
    pub fn with_violation_horizon_seconds(mut self, seconds: i64) -> Self {
        self.violation_horizon_seconds = bounded_seconds(seconds);
        self
    }

    #[must_use]
    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_ban_seconds(mut self, seconds: i64) -> Self {
        self.ban_seconds = bounded_seconds(seconds);
        self
    }

    #[must_use]
    pub fn with_cache_ttl(mut self, ttl: std::time::Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    #[must_use]
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    #[must_use]
    pub fn ban_seconds(&self) -> i64 {
        self.ban_seconds
    }
}

/// Active rules for a single IP.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IpRuleSet {
    pub whitelist: Option<IpRule>,
    pub blacklist: Option<IpRule>,
    pub auto_ban: Option<IpRule>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ViolationOutcome {
    pub violation: RateLimitViolation,
    /// Set when this violation created or extended an auto-ban.
    pub ban: Option<IpRule>,
}

pub struct RuleBook {
    store: Arc<dyn RuleStore>,
    clock: Arc<dyn Clock>,
    cache: TtlCache<String, IpRuleSet>,
    config: EscalationConfig,
}

impl RuleBook {
    #[must_use]
    pub fn new(store: Arc<dyn RuleStore>, clock: Arc<dyn Clock>, config: EscalationConfig) -> Self {
        Self {
            store,
            clock,
            cache: TtlCache::new(config.cache_ttl),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &EscalationConfig {
        &self.config
    }

    /// Whitelist, blacklist and auto-ban rules for `ip`, served from cache when fresh.
    ///
    /// Cached rules may have lapsed since they were loaded; check
    /// [`IpRule::is_effective`] before acting on them.
    ///
    /// # Errors
    /// Returns the store error on a cache miss that cannot be loaded.
    pub async fn lookup(&self, ip: &str) -> Result<IpRuleSet, StoreError> {
        let store = self.store.as_ref();
        let now = self.clock.now();
        cache_aside(&self.cache, ip.to_string(), move || async move {
            Ok(IpRuleSet {
                whitelist: store.active_rule(ip, RuleKind::Whitelist, now).await?,
                blacklist: store.active_rule(ip, RuleKind::Blacklist, now).await?,
                auto_ban: store.active_rule(ip, RuleKind::AutoBanned, now).await?,
            })
        })
        .await
    }

    /// # Errors
    /// Returns the store error if the rules cannot be loaded.
    pub async fn is_whitelisted(&self, ip: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        Ok(self
            .lookup(ip)
            .await?
            .whitelist
            .is_some_and(|rule| rule.is_effective(now)))
    }

    /// # Errors
    /// Returns the store error if the write fails.
    pub async fn upsert(&self, rule: &NewIpRule) -> Result<IpRule, StoreError> {
        let saved = self.store.upsert_rule(rule, self.clock.now()).await?;
        self.cache.invalidate(&rule.ip);
        Ok(saved)
    }

    /// # Errors
    /// Returns the store error if the write fails.
    pub async fn deactivate(&self, ip: &str, kind: RuleKind) -> Result<u64, StoreError> {
        let deactivated = self.store.deactivate_rule(ip, kind, self.clock.now()).await?;
        self.cache.invalidate(&ip.to_string());
        Ok(deactivated)
    }

    /// # Errors
    /// Returns the store error if the read fails.
    pub async fn list(&self, kind: Option<RuleKind>) -> Result<Vec<IpRule>, StoreError> {
        self.store.list_rules(kind, self.clock.now()).await
    }

    /// Record a violation and auto-ban the IP once the escalation threshold is reached.
    ///
    /// # Errors
    /// Returns the store error if the violation or ban cannot be written.
    pub async fn record_violation(
        &self,
        ip: &str,
        endpoint: &str,
    ) -> Result<ViolationOutcome, StoreError> {
        let now = self.clock.now();
        let violation = self
            .store
            .record_violation(
                ip,
                endpoint,
                now,
                Duration::seconds(self.config.violation_horizon_seconds),
            )
            .await?;

        if violation.count < self.config.threshold {
            return Ok(ViolationOutcome {
                violation,
                ban: None,
            });
        }

        let rule = NewIpRule::new(ip, RuleKind::AutoBanned, "repeated rate limit violations")
            .with_trigger(BanTrigger {
                endpoint: endpoint.to_string(),
                violations: violation.count,
            })
            .with_expires_at(Some(now + Duration::seconds(self.config.ban_seconds)));
        let ban = self.upsert(&rule).await?;
        self.store.mark_violation_banned(ip, endpoint).await?;
        warn!(
            security_event = "ip_auto_banned",
            ip,
            endpoint,
            violations = violation.count,
            expires_at = %ban.expires_at.unwrap_or(now),
            "IP auto-banned after repeated violations"
        );
        Ok(ViolationOutcome {
            violation,
            ban: Some(ban),
        })
    }

    /// Deactivate rules whose expiry has passed.
    ///
    /// # Errors
    /// Returns the store error if the update fails.
    pub async fn deactivate_expired(&self) -> Result<u64, StoreError> {
        let deactivated = self.store.deactivate_expired_rules(self.clock.now()).await?;
        if deactivated > 0 {
            self.cache.clear();
        }
        Ok(deactivated)
    }

    /// # Errors
    /// Returns the store error if the delete fails.
    pub async fn delete_stale_violations(&self, retention: Duration) -> Result<u64, StoreError> {
        self.store
            .delete_stale_violations(self.clock.now() - retention)
            .await
    }
}
