use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{postgres::PgRow, Row};
use std::collections::BTreeMap;
use tracing::{warn, Instrument};
use uuid::Uuid;

use super::{count_from_i32, db_span, PgStore};
use crate::rules::{BanTrigger, IpRule, NewIpRule, RateLimitViolation, RuleKind};
use crate::store::{bounded, RuleStore, StoreError};

const RULE_COLUMNS: &str = "id, ip, kind, reason, trigger_endpoint, trigger_violations, \
     expires_at, active, created_by, created_at, updated_at, metadata::text AS metadata";

fn rule_from_row(row: &PgRow) -> Option<IpRule> {
    let kind: String = row.get("kind");
    let Some(kind) = RuleKind::parse(&kind) else {
        warn!("Skipping ip_rules row with unknown kind: {kind}");
        return None;
    };
    let endpoint: Option<String> = row.get("trigger_endpoint");
    let violations: Option<i32> = row.get("trigger_violations");
    let trigger = endpoint.map(|endpoint| BanTrigger {
        endpoint,
        violations: violations.map_or(0, count_from_i32),
    });
    let metadata: String = row.get("metadata");
    let metadata: BTreeMap<String, String> =
        serde_json::from_str(&metadata).unwrap_or_else(|err| {
            warn!("Ignoring malformed ip_rules metadata: {err}");
            BTreeMap::new()
        });
    Some(IpRule {
        id: row.get("id"),
        ip: row.get("ip"),
        kind,
        reason: row.get("reason"),
        trigger,
        expires_at: row.get("expires_at"),
        active: row.get("active"),
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        metadata,
    })
}

fn violation_from_row(row: &PgRow) -> RateLimitViolation {
    RateLimitViolation {
        ip: row.get("ip"),
        endpoint: row.get("endpoint"),
        count: count_from_i32(row.get("count")),
        first_violation_at: row.get("first_violation_at"),
        last_violation_at: row.get("last_violation_at"),
        auto_banned: row.get("auto_banned"),
    }
}

#[async_trait]
impl RuleStore for PgStore {
    async fn active_rule(
        &self,
        ip: &str,
        kind: RuleKind,
        now: DateTime<Utc>,
    ) -> Result<Option<IpRule>, StoreError> {
        let query = format!(
            "SELECT {RULE_COLUMNS} FROM ip_rules \
             WHERE ip = $1 AND kind = $2 AND active AND (expires_at IS NULL OR expires_at > $3) \
             LIMIT 1"
        );
        bounded(self.timeout, async {
            let row = sqlx::query(&query)
                .bind(ip)
                .bind(kind.as_str())
                .bind(now)
                .fetch_optional(&self.pool)
                .instrument(db_span(
                    "SELECT",
                    "SELECT .. FROM ip_rules WHERE ip = $1 AND kind = $2 AND active",
                ))
                .await?;
            Ok(row.as_ref().and_then(rule_from_row))
        })
        .await
    }

    async fn upsert_rule(
        &self,
        rule: &NewIpRule,
        now: DateTime<Utc>,
    ) -> Result<IpRule, StoreError> {
        let metadata = serde_json::to_string(&rule.metadata)
            .map_err(|err| StoreError::Unavailable(format!("invalid rule metadata: {err}")))?;
        let upsert = format!(
            "INSERT INTO ip_rules \
                 (id, ip, kind, reason, trigger_endpoint, trigger_violations, expires_at, \
                  active, created_by, created_at, updated_at, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE, $8, $9, $9, $10::jsonb) \
             ON CONFLICT (ip, kind) WHERE active DO UPDATE SET \
                 reason = EXCLUDED.reason, \
                 expires_at = EXCLUDED.expires_at, \
                 trigger_endpoint = \
                     COALESCE(EXCLUDED.trigger_endpoint, ip_rules.trigger_endpoint), \
                 trigger_violations = \
                     COALESCE(EXCLUDED.trigger_violations, ip_rules.trigger_violations), \
                 metadata = ip_rules.metadata || EXCLUDED.metadata, \
                 updated_at = EXCLUDED.updated_at \
             RETURNING {RULE_COLUMNS}"
        );
        bounded(self.timeout, async {
            let mut tx = self.pool.begin().await?;

            // A lapsed rule still flagged active would otherwise be extended
            // instead of replaced.
            let expire = r"
                UPDATE ip_rules SET active = FALSE, updated_at = $3
                WHERE ip = $1 AND kind = $2 AND active
                  AND expires_at IS NOT NULL AND expires_at <= $3
            ";
            sqlx::query(expire)
                .bind(&rule.ip)
                .bind(rule.kind.as_str())
                .bind(now)
                .execute(&mut *tx)
                .instrument(db_span("UPDATE", expire))
                .await?;

            let row = sqlx::query(&upsert)
                .bind(Uuid::new_v4())
                .bind(&rule.ip)
                .bind(rule.kind.as_str())
                .bind(&rule.reason)
                .bind(rule.trigger.as_ref().map(|trigger| trigger.endpoint.clone()))
                .bind(
                    rule.trigger
                        .as_ref()
                        .map(|trigger| i32::try_from(trigger.violations).unwrap_or(i32::MAX)),
                )
                .bind(rule.expires_at)
                .bind(&rule.created_by)
                .bind(now)
                .bind(&metadata)
                .fetch_one(&mut *tx)
                .instrument(db_span("INSERT", "INSERT INTO ip_rules .. ON CONFLICT DO UPDATE"))
                .await?;

            tx.commit().await?;
            rule_from_row(&row)
                .ok_or_else(|| StoreError::Unavailable("ip_rules returned an unknown kind".into()))
        })
        .await
    }

    async fn deactivate_rule(
        &self,
        ip: &str,
        kind: RuleKind,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let query = r"
            UPDATE ip_rules SET active = FALSE, updated_at = $3
            WHERE ip = $1 AND kind = $2 AND active
        ";
        bounded(self.timeout, async {
            let result = sqlx::query(query)
                .bind(ip)
                .bind(kind.as_str())
                .bind(now)
                .execute(&self.pool)
                .instrument(db_span("UPDATE", query))
                .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn list_rules(
        &self,
        kind: Option<RuleKind>,
        now: DateTime<Utc>,
    ) -> Result<Vec<IpRule>, StoreError> {
        let query = format!(
            "SELECT {RULE_COLUMNS} FROM ip_rules \
             WHERE active AND (expires_at IS NULL OR expires_at > $1) \
               AND ($2::text IS NULL OR kind = $2) \
             ORDER BY created_at DESC"
        );
        bounded(self.timeout, async {
            let rows = sqlx::query(&query)
                .bind(now)
                .bind(kind.map(|kind| kind.as_str()))
                .fetch_all(&self.pool)
                .instrument(db_span("SELECT", "SELECT .. FROM ip_rules WHERE active"))
                .await?;
            Ok(rows.iter().filter_map(rule_from_row).collect())
        })
        .await
    }

    async fn record_violation(
        &self,
        ip: &str,
        endpoint: &str,
        now: DateTime<Utc>,
        horizon: Duration,
    ) -> Result<RateLimitViolation, StoreError> {
        // $4 is the horizon cutoff: an entry last seen before it starts over.
        let query = r"
            INSERT INTO rate_limit_violations
                (ip, endpoint, count, first_violation_at, last_violation_at, auto_banned)
            VALUES ($1, $2, 1, $3, $3, FALSE)
            ON CONFLICT (ip, endpoint) DO UPDATE SET
                count = CASE WHEN rate_limit_violations.last_violation_at < $4
                    THEN 1 ELSE rate_limit_violations.count + 1 END,
                first_violation_at = CASE WHEN rate_limit_violations.last_violation_at < $4
                    THEN $3 ELSE rate_limit_violations.first_violation_at END,
                auto_banned = CASE WHEN rate_limit_violations.last_violation_at < $4
                    THEN FALSE ELSE rate_limit_violations.auto_banned END,
                last_violation_at = $3
            RETURNING ip, endpoint, count, first_violation_at, last_violation_at, auto_banned
        ";
        bounded(self.timeout, async {
            let row = sqlx::query(query)
                .bind(ip)
                .bind(endpoint)
                .bind(now)
                .bind(now - horizon)
                .fetch_one(&self.pool)
                .instrument(db_span("INSERT", query))
                .await?;
            Ok(violation_from_row(&row))
        })
        .await
    }

    async fn mark_violation_banned(&self, ip: &str, endpoint: &str) -> Result<(), StoreError> {
        let query =
            "UPDATE rate_limit_violations SET auto_banned = TRUE WHERE ip = $1 AND endpoint = $2";
        bounded(self.timeout, async {
            sqlx::query(query)
                .bind(ip)
                .bind(endpoint)
                .execute(&self.pool)
                .instrument(db_span("UPDATE", query))
                .await?;
            Ok(())
        })
        .await
    }

    async fn deactivate_expired_rules(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let query = r"
            UPDATE ip_rules SET active = FALSE, updated_at = $1
            WHERE active AND expires_at IS NOT NULL AND expires_at <= $1
        ";
        bounded(self.timeout, async {
            let result = sqlx::query(query)
                .bind(now)
                .execute(&self.pool)
                .instrument(db_span("UPDATE", query))
                .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn delete_stale_violations(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let query = "DELETE FROM rate_limit_violations WHERE last_violation_at < $1";
        bounded(self.timeout, async {
            let result = sqlx::query(query)
                .bind(before)
                .execute(&self.pool)
                .instrument(db_span("DELETE", query))
                .await?;
            Ok(result.rows_affected())
        })
        .await
    }
}
