//! In-process store for tests and single-node development.
//!
//! One mutex guards all tables, so the compare-and-swap operations
//! (`rotate_refresh_token`, `insert_lockout_if_unlocked`) are atomic.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use super::{LockoutStore, RuleStore, StoreError, TokenStore};
use crate::lockout::model::{AttemptOutcome, Lockout, LockoutTarget, LoginAttempt};
use crate::rules::{IpRule, NewIpRule, RateLimitViolation, RuleKind};
use crate::tokens::model::{BlacklistEntry, RefreshTokenRecord, RevocationReason};

#[derive(Debug, Default)]
struct Tables {
    refresh_tokens: Vec<RefreshTokenRecord>,
    blacklist: HashMap<String, BlacklistEntry>,
    attempts: Vec<LoginAttempt>,
    lockouts: Vec<Lockout>,
    rules: Vec<IpRule>,
    violations: HashMap<(String, String), RateLimitViolation>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of login attempts currently retained.
    #[must_use]
    pub fn attempt_count(&self) -> usize {
        self.tables().attempts.len()
    }

    /// Every lockout row for the target, including closed ones.
    #[must_use]
    pub fn lockout_history(&self, target: &LockoutTarget) -> Vec<Lockout> {
        self.tables()
            .lockouts
            .iter()
            .filter(|lockout| &lockout.target == target)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn violation(&self, ip: &str, endpoint: &str) -> Option<RateLimitViolation> {
        self.tables()
            .violations
            .get(&(ip.to_string(), endpoint.to_string()))
            .cloned()
    }
}

fn attempt_matches(attempt: &LoginAttempt, target: &LockoutTarget) -> bool {
    match target {
        LockoutTarget::Account(identifier) => &attempt.identifier == identifier,
        LockoutTarget::Ip(ip) => attempt.ip.as_deref() == Some(ip.as_str()),
    }
}

fn to_u64(count: usize) -> u64 {
    u64::try_from(count).unwrap_or(u64::MAX)
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn insert_refresh_token(&self, record: &RefreshTokenRecord) -> Result<(), StoreError> {
        self.tables().refresh_tokens.push(record.clone());
        Ok(())
    }

    async fn find_refresh_token(
        &self,
        token_hash: &[u8],
    ) -> Result<Option<RefreshTokenRecord>, StoreError> {
        Ok(self
            .tables()
            .refresh_tokens
            .iter()
            .find(|record| record.token_hash == token_hash)
            .cloned())
    }

    async fn rotate_refresh_token(
        &self,
        old_id: Uuid,
        replacement: &RefreshTokenRecord,
        revoked_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables();
        let Some(old) = tables
            .refresh_tokens
            .iter_mut()
            .find(|record| record.id == old_id && record.revoked_at.is_none())
        else {
            return Ok(false);
        };
        old.revoked_at = Some(revoked_at);
        old.revocation_reason = Some(RevocationReason::Rotated);
        old.replaced_by = Some(replacement.id);
        tables.refresh_tokens.push(replacement.clone());
        Ok(true)
    }

    async fn revoke_family(
        &self,
        family_id: Uuid,
        revoked_at: DateTime<Utc>,
        reason: RevocationReason,
    ) -> Result<u64, StoreError> {
        let mut revoked = 0;
        for record in &mut self.tables().refresh_tokens {
            if record.family_id == family_id && record.revoked_at.is_none() {
                record.revoked_at = Some(revoked_at);
                record.revocation_reason = Some(reason);
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn revoke_user_tokens(
        &self,
        user_id: Uuid,
        revoked_at: DateTime<Utc>,
        reason: RevocationReason,
    ) -> Result<u64, StoreError> {
        let mut revoked = 0;
        for record in &mut self.tables().refresh_tokens {
            if record.user_id == user_id && record.revoked_at.is_none() {
                record.revoked_at = Some(revoked_at);
                record.revocation_reason = Some(reason);
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn family_tokens(&self, family_id: Uuid) -> Result<Vec<RefreshTokenRecord>, StoreError> {
        let mut family: Vec<RefreshTokenRecord> = self
            .tables()
            .refresh_tokens
            .iter()
            .filter(|record| record.family_id == family_id)
            .cloned()
            .collect();
        family.sort_by_key(|record| record.created_at);
        Ok(family)
    }

    async fn delete_expired_refresh_tokens(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tables = self.tables();
        let before = tables.refresh_tokens.len();
        tables.refresh_tokens.retain(|record| record.expires_at > now);
        Ok(to_u64(before - tables.refresh_tokens.len()))
    }

    async fn insert_blacklist_entry(&self, entry: &BlacklistEntry) -> Result<(), StoreError> {
        self.tables()
            .blacklist
            .entry(entry.jti.clone())
            .or_insert_with(|| entry.clone());
        Ok(())
    }

    async fn blacklist_entry_exists(&self, jti: &str) -> Result<bool, StoreError> {
        Ok(self.tables().blacklist.contains_key(jti))
    }

    async fn delete_expired_blacklist_entries(
        &self,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut tables = self.tables();
        let before = tables.blacklist.len();
        tables.blacklist.retain(|_, entry| entry.expires_at > now);
        Ok(to_u64(before - tables.blacklist.len()))
    }
}

#[async_trait]
impl LockoutStore for MemoryStore {
    async fn append_attempt(&self, attempt: &LoginAttempt) -> Result<(), StoreError> {
        self.tables().attempts.push(attempt.clone());
        Ok(())
    }

    async fn count_failures_since(
        &self,
        target: &LockoutTarget,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let count = self
            .tables()
            .attempts
            .iter()
            .filter(|attempt| {
                attempt.outcome == AttemptOutcome::Failure
                    && attempt.attempted_at >= since
                    && attempt_matches(attempt, target)
            })
            .count();
        Ok(to_u64(count))
    }

    async fn active_lockout(
        &self,
        target: &LockoutTarget,
        now: DateTime<Utc>,
    ) -> Result<Option<Lockout>, StoreError> {
        Ok(self
            .tables()
            .lockouts
            .iter()
            .filter(|lockout| &lockout.target == target && lockout.is_active(now))
            .max_by_key(|lockout| lockout.locked_at)
            .cloned())
    }

    async fn latest_lockout(&self, target: &LockoutTarget) -> Result<Option<Lockout>, StoreError> {
        Ok(self
            .tables()
            .lockouts
            .iter()
            .filter(|lockout| &lockout.target == target)
            .max_by_key(|lockout| lockout.locked_at)
            .cloned())
    }

    async fn count_lockouts_since(
        &self,
        target: &LockoutTarget,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let count = self
            .tables()
            .lockouts
            .iter()
            .filter(|lockout| &lockout.target == target && lockout.locked_at >= since)
            .count();
        Ok(to_u64(count))
    }

    async fn insert_lockout_if_unlocked(
        &self,
        lockout: &Lockout,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables();
        let already_locked = tables
            .lockouts
            .iter()
            .any(|existing| existing.target == lockout.target && existing.is_active(now));
        if already_locked {
            return Ok(false);
        }
        tables.lockouts.push(lockout.clone());
        Ok(true)
    }

    async fn manual_unlock(
        &self,
        target: &LockoutTarget,
        at: DateTime<Utc>,
        actor: &str,
    ) -> Result<u64, StoreError> {
        let mut unlocked = 0;
        for lockout in &mut self.tables().lockouts {
            if &lockout.target == target && lockout.is_active(at) {
                lockout.manual_unlock_at = Some(at);
                lockout.unlocked_by = Some(actor.to_string());
                unlocked += 1;
            }
        }
        Ok(unlocked)
    }

    async fn delete_attempts_before(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tables = self.tables();
        let count = tables.attempts.len();
        tables.attempts.retain(|attempt| attempt.attempted_at >= before);
        Ok(to_u64(count - tables.attempts.len()))
    }

    async fn delete_closed_lockouts_before(
        &self,
        before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut tables = self.tables();
        let count = tables.lockouts.len();
        tables
            .lockouts
            .retain(|lockout| lockout.locked_at >= before || lockout.is_active(now));
        Ok(to_u64(count - tables.lockouts.len()))
    }
}

#[async_trait]
impl RuleStore for MemoryStore {
    async fn active_rule(
        &self,
        ip: &str,
        kind: RuleKind,
        now: DateTime<Utc>,
    ) -> Result<Option<IpRule>, StoreError> {
        Ok(self
            .tables()
            .rules
            .iter()
            .find(|rule| rule.ip == ip && rule.kind == kind && rule.is_effective(now))
            .cloned())
    }

    async fn upsert_rule(
        &self,
        rule: &NewIpRule,
        now: DateTime<Utc>,
    ) -> Result<IpRule, StoreError> {
        let mut tables = self.tables();
        if let Some(existing) = tables.rules.iter_mut().find(|existing| {
            existing.ip == rule.ip && existing.kind == rule.kind && existing.is_effective(now)
        }) {
            existing.reason.clone_from(&rule.reason);
            existing.expires_at = rule.expires_at;
            if rule.trigger.is_some() {
                existing.trigger.clone_from(&rule.trigger);
            }
            existing.metadata.extend(rule.metadata.clone());
            existing.updated_at = now;
            return Ok(existing.clone());
        }
        let created = IpRule {
            id: Uuid::new_v4(),
            ip: rule.ip.clone(),
            kind: rule.kind,
            reason: rule.reason.clone(),
            trigger: rule.trigger.clone(),
            expires_at: rule.expires_at,
            active: true,
            created_by: rule.created_by.clone(),
            created_at: now,
            updated_at: now,
            metadata: rule.metadata.clone(),
        };
        tables.rules.push(created.clone());
        Ok(created)
    }

    async fn deactivate_rule(
        &self,
        ip: &str,
        kind: RuleKind,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut deactivated = 0;
        for rule in &mut self.tables().rules {
            if rule.ip == ip && rule.kind == kind && rule.active {
                rule.active = false;
                rule.updated_at = now;
                deactivated += 1;
            }
        }
        Ok(deactivated)
    }

    async fn list_rules(
        &self,
        kind: Option<RuleKind>,
        now: DateTime<Utc>,
    ) -> Result<Vec<IpRule>, StoreError> {
        let mut rules: Vec<IpRule> = self
            .tables()
            .rules
            .iter()
            .filter(|rule| rule.is_effective(now) && kind.map_or(true, |kind| rule.kind == kind))
            .cloned()
            .collect();
        rules.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rules)
    }

    async fn record_violation(
        &self,
        ip: &str,
        endpoint: &str,
        now: DateTime<Utc>,
        horizon: Duration,
    ) -> Result<RateLimitViolation, StoreError> {
        let mut tables = self.tables();
        let violation = tables
            .violations
            .entry((ip.to_string(), endpoint.to_string()))
            .and_modify(|violation| {
                if now - violation.last_violation_at > horizon {
                    violation.count = 1;
                    violation.first_violation_at = now;
                    violation.auto_banned = false;
                } else {
                    violation.count = violation.count.saturating_add(1);
                }
                violation.last_violation_at = now;
            })
            .or_insert_with(|| RateLimitViolation {
                ip: ip.to_string(),
                endpoint: endpoint.to_string(),
                count: 1,
                first_violation_at: now,
                last_violation_at: now,
                auto_banned: false,
            });
        Ok(violation.clone())
    }

    async fn mark_violation_banned(&self, ip: &str, endpoint: &str) -> Result<(), StoreError> {
        if let Some(violation) = self
            .tables()
            .violations
            .get_mut(&(ip.to_string(), endpoint.to_string()))
        {
            violation.auto_banned = true;
        }
        Ok(())
    }

    async fn deactivate_expired_rules(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut deactivated = 0;
        for rule in &mut self.tables().rules {
            if rule.active && rule.expires_at.is_some_and(|expires_at| expires_at <= now) {
                rule.active = false;
                rule.updated_at = now;
                deactivated += 1;
            }
        }
        Ok(deactivated)
    }

    async fn delete_stale_violations(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tables = self.tables();
        let count = tables.violations.len();
        tables
            .violations
            .retain(|_, violation| violation.last_violation_at >= before);
        Ok(to_u64(count - tables.violations.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(family_id: Uuid, now: DateTime<Utc>) -> RefreshTokenRecord {
        let id = Uuid::new_v4();
        RefreshTokenRecord {
            id,
            token_hash: id.as_bytes().to_vec(),
            user_id: Uuid::nil(),
            tenant_id: Uuid::nil(),
            family_id,
            device_info: None,
            ip: None,
            created_at: now,
            expires_at: now + Duration::days(30),
            revoked_at: None,
            revocation_reason: None,
            replaced_by: None,
        }
    }

    fn lockout(ip: &str, now: DateTime<Utc>) -> Lockout {
        Lockout {
            id: Uuid::new_v4(),
            target: LockoutTarget::Ip(ip.to_string()),
            failed_count: 10,
            locked_at: now,
            unlock_at: now + Duration::hours(1),
            reason: "too many failed login attempts".to_string(),
            manual_unlock_at: None,
            unlocked_by: None,
        }
    }

    #[tokio::test]
    async fn rotation_only_succeeds_once() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let family = Uuid::new_v4();
        let original = token(family, now);
        store.insert_refresh_token(&original).await.unwrap();

        let first = token(family, now);
        let second = token(family, now);
        assert!(store.rotate_refresh_token(original.id, &first, now).await.unwrap());
        assert!(!store.rotate_refresh_token(original.id, &second, now).await.unwrap());

        let tokens = store.family_tokens(family).await.unwrap();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].replaced_by, Some(first.id));
        assert_eq!(tokens[0].revocation_reason, Some(RevocationReason::Rotated));
    }

    #[tokio::test]
    async fn conditional_lockout_insert_keeps_one_active_row() {
        let store = MemoryStore::new();
        let now = Utc::now();
        assert!(store
            .insert_lockout_if_unlocked(&lockout("198.51.100.4", now), now)
            .await
            .unwrap());
        assert!(!store
            .insert_lockout_if_unlocked(&lockout("198.51.100.4", now), now)
            .await
            .unwrap());
        let target = LockoutTarget::Ip("198.51.100.4".to_string());
        assert_eq!(store.lockout_history(&target).len(), 1);
    }

    #[tokio::test]
    async fn closed_lockout_cleanup_spares_active_rows() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut old = lockout("198.51.100.4", now - Duration::days(40));
        old.unlock_at = now - Duration::days(39);
        store.lockouts_push(old);
        let mut long = lockout("198.51.100.5", now - Duration::days(40));
        long.unlock_at = now + Duration::hours(1);
        store.lockouts_push(long);

        let deleted = store
            .delete_closed_lockouts_before(now - Duration::days(30), now)
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        let target = LockoutTarget::Ip("198.51.100.5".to_string());
        assert!(store.active_lockout(&target, now).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn violations_reset_after_horizon() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let horizon = Duration::hours(1);
        store.record_violation("203.0.113.9", "global", now, horizon).await.unwrap();
        let second = store
            .record_violation("203.0.113.9", "global", now + Duration::minutes(10), horizon)
            .await
            .unwrap();
        assert_eq!(second.count, 2);
        let reset = store
            .record_violation("203.0.113.9", "global", now + Duration::hours(3), horizon)
            .await
            .unwrap();
        assert_eq!(reset.count, 1);
    }

    #[tokio::test]
    async fn upsert_extends_the_active_rule() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let first = store
            .upsert_rule(
                &NewIpRule::new("203.0.113.9", RuleKind::AutoBanned, "violations")
                    .with_expires_at(Some(now + Duration::hours(1))),
                now,
            )
            .await
            .unwrap();
        let second = store
            .upsert_rule(
                &NewIpRule::new("203.0.113.9", RuleKind::AutoBanned, "violations again")
                    .with_expires_at(Some(now + Duration::hours(24))),
                now,
            )
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.reason, "violations again");
        assert_eq!(store.list_rules(None, now).await.unwrap().len(), 1);
    }

    impl MemoryStore {
        fn lockouts_push(&self, lockout: Lockout) {
            self.tables().lockouts.push(lockout);
        }
    }
}
