use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, Row};
use tracing::Instrument;

use super::{count_from_i32, db_span, PgStore};
use crate::lockout::model::{Lockout, LockoutTarget, LoginAttempt};
use crate::store::{bounded, LockoutStore, StoreError};

/// Statements for one lockout table. Accounts and IPs share the row shape.
struct LockoutSql {
    count_failures: &'static str,
    active: &'static str,
    latest: &'static str,
    count_since: &'static str,
    advisory_lock: &'static str,
    insert: &'static str,
    unlock: &'static str,
}

const ACCOUNT_SQL: LockoutSql = LockoutSql {
    count_failures: r"
        SELECT COUNT(*) FROM login_attempts
        WHERE identifier = $1 AND outcome = 'failure' AND attempted_at >= $2
    ",
    active: r"
        SELECT id, identifier AS target, failed_count, locked_at, unlock_at, reason,
               manual_unlock_at, unlocked_by
        FROM account_lockouts
        WHERE identifier = $1 AND manual_unlock_at IS NULL AND unlock_at > $2
        ORDER BY locked_at DESC
        LIMIT 1
    ",
    latest: r"
        SELECT id, identifier AS target, failed_count, locked_at, unlock_at, reason,
               manual_unlock_at, unlocked_by
        FROM account_lockouts
        WHERE identifier = $1
        ORDER BY locked_at DESC
        LIMIT 1
    ",
    count_since: "SELECT COUNT(*) FROM account_lockouts WHERE identifier = $1 AND locked_at >= $2",
    advisory_lock: "SELECT pg_advisory_xact_lock(hashtext('account_lockouts:' || $1))",
    insert: r"
        INSERT INTO account_lockouts (id, identifier, failed_count, locked_at, unlock_at, reason)
        SELECT $1, $2, $3, $4, $5, $6
        WHERE NOT EXISTS (
            SELECT 1 FROM account_lockouts
            WHERE identifier = $2 AND manual_unlock_at IS NULL AND unlock_at > $7
        )
    ",
    unlock: r"
        UPDATE account_lockouts
        SET manual_unlock_at = $2, unlocked_by = $3
        WHERE identifier = $1 AND manual_unlock_at IS NULL AND unlock_at > $2
    ",
};

const IP_SQL: LockoutSql = LockoutSql {
    count_failures: r"
        SELECT COUNT(*) FROM login_attempts
        WHERE ip = $1 AND outcome = 'failure' AND attempted_at >= $2
    ",
    active: r"
        SELECT id, ip AS target, failed_count, locked_at, unlock_at, reason,
               manual_unlock_at, unlocked_by
        FROM ip_lockouts
        WHERE ip = $1 AND manual_unlock_at IS NULL AND unlock_at > $2
        ORDER BY locked_at DESC
        LIMIT 1
    ",
    latest: r"
        SELECT id, ip AS target, failed_count, locked_at, unlock_at, reason,
               manual_unlock_at, unlocked_by
        FROM ip_lockouts
        WHERE ip = $1
        ORDER BY locked_at DESC
        LIMIT 1
    ",
    count_since: "SELECT COUNT(*) FROM ip_lockouts WHERE ip = $1 AND locked_at >= $2",
    advisory_lock: "SELECT pg_advisory_xact_lock(hashtext('ip_lockouts:' || $1))",
    insert: r"
        INSERT INTO ip_lockouts (id, ip, failed_count, locked_at, unlock_at, reason)
        SELECT $1, $2, $3, $4, $5, $6
        WHERE NOT EXISTS (
            SELECT 1 FROM ip_lockouts
            WHERE ip = $2 AND manual_unlock_at IS NULL AND unlock_at > $7
        )
    ",
    unlock: r"
        UPDATE ip_lockouts
        SET manual_unlock_at = $2, unlocked_by = $3
        WHERE ip = $1 AND manual_unlock_at IS NULL AND unlock_at > $2
    ",
};

fn sql_for(target: &LockoutTarget) -> &'static LockoutSql {
    match target {
        LockoutTarget::Account(_) => &ACCOUNT_SQL,
        LockoutTarget::Ip(_) => &IP_SQL,
    }
}

fn lockout_from_row(row: &PgRow, target: &LockoutTarget) -> Lockout {
    let value: String = row.get("target");
    let target = match target {
        LockoutTarget::Account(_) => LockoutTarget::Account(value),
        LockoutTarget::Ip(_) => LockoutTarget::Ip(value),
    };
    Lockout {
        id: row.get("id"),
        target,
        failed_count: count_from_i32(row.get("failed_count")),
        locked_at: row.get("locked_at"),
        unlock_at: row.get("unlock_at"),
        reason: row.get("reason"),
        manual_unlock_at: row.get("manual_unlock_at"),
        unlocked_by: row.get("unlocked_by"),
    }
}

fn count_to_u64(count: i64) -> u64 {
    u64::try_from(count).unwrap_or(0)
}

#[async_trait]
impl LockoutStore for PgStore {
    async fn append_attempt(&self, attempt: &LoginAttempt) -> Result<(), StoreError> {
        let query = r"
            INSERT INTO login_attempts (id, identifier, ip, outcome, reason, attempted_at)
            VALUES ($1, $2, $3, $4, $5, $6)
        ";
        bounded(self.timeout, async {
            sqlx::query(query)
                .bind(attempt.id)
                .bind(&attempt.identifier)
                .bind(&attempt.ip)
                .bind(attempt.outcome.as_str())
                .bind(&attempt.reason)
                .bind(attempt.attempted_at)
                .execute(&self.pool)
                .instrument(db_span("INSERT", query))
                .await?;
            Ok(())
        })
        .await
    }

    async fn count_failures_since(
        &self,
        target: &LockoutTarget,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let query = sql_for(target).count_failures;
        bounded(self.timeout, async {
            let row = sqlx::query(query)
                .bind(target.value())
                .bind(since)
                .fetch_one(&self.pool)
                .instrument(db_span("SELECT", query))
                .await?;
            Ok(count_to_u64(row.get(0)))
        })
        .await
    }

    async fn active_lockout(
        &self,
        target: &LockoutTarget,
        now: DateTime<Utc>,
    ) -> Result<Option<Lockout>, StoreError> {
        let query = sql_for(target).active;
        bounded(self.timeout, async {
            let row = sqlx::query(query)
                .bind(target.value())
                .bind(now)
                .fetch_optional(&self.pool)
                .instrument(db_span("SELECT", query))
                .await?;
            Ok(row.map(|row| lockout_from_row(&row, target)))
        })
        .await
    }

    async fn latest_lockout(&self, target: &LockoutTarget) -> Result<Option<Lockout>, StoreError> {
        let query = sql_for(target).latest;
        bounded(self.timeout, async {
            let row = sqlx::query(query)
                .bind(target.value())
                .fetch_optional(&self.pool)
                .instrument(db_span("SELECT", query))
                .await?;
            Ok(row.map(|row| lockout_from_row(&row, target)))
        })
        .await
    }

    async fn count_lockouts_since(
        &self,
        target: &LockoutTarget,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let query = sql_for(target).count_since;
        bounded(self.timeout, async {
            let row = sqlx::query(query)
                .bind(target.value())
                .bind(since)
                .fetch_one(&self.pool)
                .instrument(db_span("SELECT", query))
                .await?;
            Ok(count_to_u64(row.get(0)))
        })
        .await
    }

    async fn insert_lockout_if_unlocked(
        &self,
        lockout: &Lockout,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let sql = sql_for(&lockout.target);
        bounded(self.timeout, async {
            let mut tx = self.pool.begin().await?;

            // Serialise concurrent lockout creation for the same target so the
            // NOT EXISTS guard sees the winner's row.
            sqlx::query(sql.advisory_lock)
                .bind(lockout.target.value())
                .execute(&mut *tx)
                .instrument(db_span("SELECT", sql.advisory_lock))
                .await?;

            let result = sqlx::query(sql.insert)
                .bind(lockout.id)
                .bind(lockout.target.value())
                .bind(i32::try_from(lockout.failed_count).unwrap_or(i32::MAX))
                .bind(lockout.locked_at)
                .bind(lockout.unlock_at)
                .bind(&lockout.reason)
                .bind(now)
                .execute(&mut *tx)
                .instrument(db_span("INSERT", sql.insert))
                .await?;

            tx.commit().await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn manual_unlock(
        &self,
        target: &LockoutTarget,
        at: DateTime<Utc>,
        actor: &str,
    ) -> Result<u64, StoreError> {
        let query = sql_for(target).unlock;
        bounded(self.timeout, async {
            let result = sqlx::query(query)
                .bind(target.value())
                .bind(at)
                .bind(actor)
                .execute(&self.pool)
                .instrument(db_span("UPDATE", query))
                .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn delete_attempts_before(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let query = "DELETE FROM login_attempts WHERE attempted_at < $1";
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

    async fn delete_closed_lockouts_before(
        &self,
        before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let account_query = r"
            DELETE FROM account_lockouts
            WHERE locked_at < $1 AND (manual_unlock_at IS NOT NULL OR unlock_at <= $2)
        ";
        let ip_query = r"
            DELETE FROM ip_lockouts
            WHERE locked_at < $1 AND (manual_unlock_at IS NOT NULL OR unlock_at <= $2)
        ";
        bounded(self.timeout, async {
            let mut deleted = 0;
            for query in [account_query, ip_query] {
                let result = sqlx::query(query)
                    .bind(before)
                    .bind(now)
                    .execute(&self.pool)
                    .instrument(db_span("DELETE", query))
                    .await?;
                deleted += result.rows_affected();
            }
            Ok(deleted)
        })
        .await
    }
}
