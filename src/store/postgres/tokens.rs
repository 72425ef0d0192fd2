use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, Row};
use tracing::{warn, Instrument};
use uuid::Uuid;

use super::{db_span, PgStore};
use crate::store::{bounded, StoreError, TokenStore};
use crate::tokens::model::{BlacklistEntry, RefreshTokenRecord, RevocationReason};

const TOKEN_COLUMNS: &str = "id, token_hash, user_id, tenant_id, family_id, device_info, ip, \
     created_at, expires_at, revoked_at, revocation_reason, replaced_by";

fn token_from_row(row: &PgRow) -> RefreshTokenRecord {
    let reason: Option<String> = row.get("revocation_reason");
    RefreshTokenRecord {
        id: row.get("id"),
        token_hash: row.get("token_hash"),
        user_id: row.get("user_id"),
        tenant_id: row.get("tenant_id"),
        family_id: row.get("family_id"),
        device_info: row.get("device_info"),
        ip: row.get("ip"),
        created_at: row.get("created_at"),
        expires_at: row.get("expires_at"),
        revoked_at: row.get("revoked_at"),
        revocation_reason: reason.as_deref().and_then(|reason| {
            let parsed = RevocationReason::parse(reason);
            if parsed.is_none() {
                warn!("Unknown revocation reason in refresh_tokens: {reason}");
            }
            parsed
        }),
        replaced_by: row.get("replaced_by"),
    }
}

const INSERT_TOKEN: &str = r"
    INSERT INTO refresh_tokens
        (id, token_hash, user_id, tenant_id, family_id, device_info, ip, created_at, expires_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
";

fn bind_insert<'q>(
    record: &'q RefreshTokenRecord,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    sqlx::query(INSERT_TOKEN)
        .bind(record.id)
        .bind(&record.token_hash)
        .bind(record.user_id)
        .bind(record.tenant_id)
        .bind(record.family_id)
        .bind(&record.device_info)
        .bind(&record.ip)
        .bind(record.created_at)
        .bind(record.expires_at)
}

#[async_trait]
impl TokenStore for PgStore {
    async fn insert_refresh_token(&self, record: &RefreshTokenRecord) -> Result<(), StoreError> {
        bounded(self.timeout, async {
            bind_insert(record)
                .execute(&self.pool)
                .instrument(db_span("INSERT", INSERT_TOKEN))
                .await?;
            Ok(())
        })
        .await
    }

    async fn find_refresh_token(
        &self,
        token_hash: &[u8],
    ) -> Result<Option<RefreshTokenRecord>, StoreError> {
        let query = format!("SELECT {TOKEN_COLUMNS} FROM refresh_tokens WHERE token_hash = $1");
        bounded(self.timeout, async {
            let row = sqlx::query(&query)
                .bind(token_hash)
                .fetch_optional(&self.pool)
                .instrument(db_span(
                    "SELECT",
                    "SELECT .. FROM refresh_tokens WHERE token_hash = $1",
                ))
                .await?;
            Ok(row.as_ref().map(token_from_row))
        })
        .await
    }

    async fn rotate_refresh_token(
        &self,
        old_id: Uuid,
        replacement: &RefreshTokenRecord,
        revoked_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        bounded(self.timeout, async {
            let mut tx = self.pool.begin().await?;

            // The replacement row must exist before `replaced_by` can point at it.
            bind_insert(replacement)
                .execute(&mut *tx)
                .instrument(db_span("INSERT", INSERT_TOKEN))
                .await?;

            let query = r"
                UPDATE refresh_tokens
                SET revoked_at = $2, revocation_reason = 'rotated', replaced_by = $3
                WHERE id = $1 AND revoked_at IS NULL
            ";
            let result = sqlx::query(query)
                .bind(old_id)
                .bind(revoked_at)
                .bind(replacement.id)
                .execute(&mut *tx)
                .instrument(db_span("UPDATE", query))
                .await?;

            if result.rows_affected() == 0 {
                tx.rollback().await?;
                return Ok(false);
            }
            tx.commit().await?;
            Ok(true)
        })
        .await
    }

    async fn revoke_family(
        &self,
        family_id: Uuid,
        revoked_at: DateTime<Utc>,
        reason: RevocationReason,
    ) -> Result<u64, StoreError> {
        let query = r"
            UPDATE refresh_tokens
            SET revoked_at = $2, revocation_reason = $3
            WHERE family_id = $1 AND revoked_at IS NULL
        ";
        bounded(self.timeout, async {
            let result = sqlx::query(query)
                .bind(family_id)
                .bind(revoked_at)
                .bind(reason.as_str())
                .execute(&self.pool)
                .instrument(db_span("UPDATE", query))
                .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn revoke_user_tokens(
        &self,
        user_id: Uuid,
        revoked_at: DateTime<Utc>,
        reason: RevocationReason,
    ) -> Result<u64, StoreError> {
        let query = r"
            UPDATE refresh_tokens
            SET revoked_at = $2, revocation_reason = $3
            WHERE user_id = $1 AND revoked_at IS NULL
        ";
        bounded(self.timeout, async {
            let result = sqlx::query(query)
                .bind(user_id)
                .bind(revoked_at)
                .bind(reason.as_str())
                .execute(&self.pool)
                .instrument(db_span("UPDATE", query))
                .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn family_tokens(&self, family_id: Uuid) -> Result<Vec<RefreshTokenRecord>, StoreError> {
        let query = format!(
            "SELECT {TOKEN_COLUMNS} FROM refresh_tokens WHERE family_id = $1 ORDER BY created_at"
        );
        bounded(self.timeout, async {
            let rows = sqlx::query(&query)
                .bind(family_id)
                .fetch_all(&self.pool)
                .instrument(db_span(
                    "SELECT",
                    "SELECT .. FROM refresh_tokens WHERE family_id = $1",
                ))
                .await?;
            Ok(rows.iter().map(token_from_row).collect())
        })
        .await
    }

    async fn delete_expired_refresh_tokens(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        // Rows still referenced through replaced_by are handled by ON DELETE SET NULL.
        let query = "DELETE FROM refresh_tokens WHERE expires_at <= $1";
        bounded(self.timeout, async {
            let result = sqlx::query(query)
                .bind(now)
                .execute(&self.pool)
                .instrument(db_span("DELETE", query))
                .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn insert_blacklist_entry(&self, entry: &BlacklistEntry) -> Result<(), StoreError> {
        let query = r"
            INSERT INTO access_token_blacklist (jti, user_id, expires_at, reason, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (jti) DO NOTHING
        ";
        bounded(self.timeout, async {
            sqlx::query(query)
                .bind(&entry.jti)
                .bind(entry.user_id)
                .bind(entry.expires_at)
                .bind(entry.reason.as_str())
                .bind(entry.created_at)
                .execute(&self.pool)
                .instrument(db_span("INSERT", query))
                .await?;
            Ok(())
        })
        .await
    }

    async fn blacklist_entry_exists(&self, jti: &str) -> Result<bool, StoreError> {
        let query = "SELECT EXISTS (SELECT 1 FROM access_token_blacklist WHERE jti = $1)";
        bounded(self.timeout, async {
            let row = sqlx::query(query)
                .bind(jti)
                .fetch_one(&self.pool)
                .instrument(db_span("SELECT", query))
                .await?;
            Ok(row.get(0))
        })
        .await
    }

    async fn delete_expired_blacklist_entries(
        &self,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let query = "DELETE FROM access_token_blacklist WHERE expires_at <= $1";
        bounded(self.timeout, async {
            let result = sqlx::query(query)
                .bind(now)
                .execute(&self.pool)
                .instrument(db_span("DELETE", query))
                .await?;
            Ok(result.rows_affected())
        })
        .await
    }
}
