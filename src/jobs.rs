//! Background maintenance.
//!
//! The cleanup worker prunes expired refresh tokens and blacklist rows, old
//! login attempts and closed lockouts, stale violation counters, and
//! deactivates IP rules whose expiry passed. The sweep worker keeps the
//! in-process counter map small when Redis is not in use.

use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::lockout::LockoutEngine;
use crate::ratelimit::MemoryCounterStore;
use crate::rules::RuleBook;
use crate::tokens::TokenManager;

#[derive(Clone, Copy, Debug)]
pub struct CleanupConfig {
    interval: Duration,
    retention_days: u32,
}

impl CleanupConfig {
    /// Default worker config: hourly runs, 30 days of login history.
    #[must_use]
    pub fn new() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            retention_days: 30,
        }
    }

    #[must_use]
    pub fn with_interval_seconds(mut self, seconds: u64) -> Self {
        self.interval = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    #[must_use]
    pub fn normalize(self) -> Self {
        let interval = if self.interval.is_zero() {
            Duration::from_secs(1)
        } else {
            self.interval
        };
        Self {
            interval,
            retention_days: self.retention_days.max(1),
        }
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    #[must_use]
    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts from one cleanup pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub refresh_tokens: u64,
    pub blacklist_entries: u64,
    pub attempts: u64,
    pub lockouts: u64,
    pub rules_deactivated: u64,
    pub violations: u64,
}

/// Run every cleanup step once. A failing step is logged and skipped.
pub async fn run_cleanup(
    tokens: &TokenManager,
    lockouts: &LockoutEngine,
    rules: &RuleBook,
    config: &CleanupConfig,
) -> CleanupReport {
    let mut report = CleanupReport::default();

    match tokens.cleanup_expired().await {
        Ok(cleanup) => {
            report.refresh_tokens = cleanup.refresh_tokens;
            report.blacklist_entries = cleanup.blacklist_entries;
        }
        Err(err) => error!("token cleanup failed: {err}"),
    }

    match lockouts.cleanup_old_records(config.retention_days()).await {
        Ok(cleanup) => {
            report.attempts = cleanup.attempts;
            report.lockouts = cleanup.lockouts;
        }
        Err(err) => error!("lockout cleanup failed: {err}"),
    }

    match rules.deactivate_expired().await {
        Ok(count) => report.rules_deactivated = count,
        Err(err) => error!("ip rule expiry failed: {err}"),
    }

    let retention = ChronoDuration::days(i64::from(config.retention_days()));
    match rules.delete_stale_violations(retention).await {
        Ok(count) => report.violations = count,
        Err(err) => error!("violation cleanup failed: {err}"),
    }

    report
}

/// Spawn the periodic cleanup worker.
pub fn spawn_cleanup_worker(
    tokens: Arc<TokenManager>,
    lockouts: Arc<LockoutEngine>,
    rules: Arc<RuleBook>,
    config: CleanupConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let config = config.normalize();

        loop {
            sleep(config.interval()).await;
            let report = run_cleanup(&tokens, &lockouts, &rules, &config).await;
            info!(
                refresh_tokens = report.refresh_tokens,
                blacklist_entries = report.blacklist_entries,
                attempts = report.attempts,
                lockouts = report.lockouts,
                rules_deactivated = report.rules_deactivated,
                violations = report.violations,
                "cleanup pass complete"
            );
        }
    })
}

/// Spawn the in-process counter sweep.
pub fn spawn_counter_sweep(
    counters: Arc<MemoryCounterStore>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    let interval = if interval.is_zero() {
        Duration::from_secs(1)
    } else {
        interval
    };
    tokio::spawn(async move {
        loop {
            sleep(interval).await;
            let removed = counters.sweep_expired();
            if removed > 0 {
                debug!(removed, "swept expired rate-limit counters");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock, OsRandom};
    use crate::lockout::{AttemptOutcome, LockoutConfig};
    use crate::rules::{EscalationConfig, NewIpRule, RuleKind};
    use crate::store::MemoryStore;
    use crate::tokens::{ClientInfo, RevocationReason, TokenConfig};
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn normalize_rejects_zero_values() {
        let config = CleanupConfig::new()
            .with_interval_seconds(0)
            .with_retention_days(0)
            .normalize();
        assert_eq!(config.interval(), Duration::from_secs(1));
        assert_eq!(config.retention_days(), 1);
    }

    #[tokio::test]
    async fn cleanup_prunes_every_table() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let rules = Arc::new(RuleBook::new(
            store.clone(),
            clock.clone(),
            EscalationConfig::default(),
        ));
        let tokens = TokenManager::new(
            store.clone(),
            clock.clone(),
            Arc::new(OsRandom),
            TokenConfig::default().with_refresh_ttl_seconds(60),
        );
        let lockouts = LockoutEngine::new(
            store.clone(),
            rules.clone(),
            clock.clone(),
            LockoutConfig::default(),
        );

        let user_id = Uuid::new_v4();
        tokens
            .issue_initial_token(user_id, Uuid::new_v4(), &ClientInfo::default())
            .await
            .unwrap();
        tokens
            .blacklist("jti-1", user_id, clock.now(), RevocationReason::Logout)
            .await
            .unwrap();
        lockouts
            .record_attempt("a@x.com", Some("192.0.2.1"), AttemptOutcome::Failure, None)
            .await
            .unwrap();
        rules
            .upsert(
                &NewIpRule::new("192.0.2.1", RuleKind::AutoBanned, "test")
                    .with_expires_at(Some(clock.now() + ChronoDuration::hours(1))),
            )
            .await
            .unwrap();
        rules.record_violation("192.0.2.1", "global").await.unwrap();

        clock.advance(ChronoDuration::days(2));
        let config = CleanupConfig::new().with_retention_days(1);
        let report = run_cleanup(&tokens, &lockouts, &rules, &config).await;

        assert_eq!(
            report,
            CleanupReport {
                refresh_tokens: 1,
                blacklist_entries: 1,
                attempts: 1,
                lockouts: 0,
                rules_deactivated: 1,
                violations: 1,
            }
        );
        assert_eq!(store.attempt_count(), 0);
    }
}
