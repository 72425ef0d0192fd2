use async_trait::async_trait;
use sqlx::{postgres::PgRow, Row};
use tracing::Instrument;
use uuid::Uuid;

use super::{db_span, PgStore};
use crate::store::{bounded, StoreError};
use crate::users::{verify_password_hash, User, UserStore};

fn user_from_row(row: &PgRow) -> User {
    User {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        identifier: row.get("identifier"),
        role: row.get("role"),
        active: row.get("active"),
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let query = "SELECT id, tenant_id, identifier, role, active FROM users WHERE id = $1";
        bounded(self.timeout, async {
            let row = sqlx::query(query)
                .bind(id)
                .fetch_optional(&self.pool)
                .instrument(db_span("SELECT", query))
                .await?;
            Ok(row.as_ref().map(user_from_row))
        })
        .await
    }

    async fn get_active_by_identifier(
        &self,
        identifier: &str,
    ) -> Result<Option<User>, StoreError> {
        let query = r"
            SELECT id, tenant_id, identifier, role, active
            FROM users
            WHERE identifier = $1 AND active
        ";
        bounded(self.timeout, async {
            let row = sqlx::query(query)
                .bind(identifier)
                .fetch_optional(&self.pool)
                .instrument(db_span("SELECT", query))
                .await?;
            Ok(row.as_ref().map(user_from_row))
        })
        .await
    }

    async fn verify_password(&self, user: &User, password: &str) -> Result<bool, StoreError> {
        let query = "SELECT password_hash FROM users WHERE id = $1";
        let hash: Option<String> = bounded(self.timeout, async {
            let row = sqlx::query(query)
                .bind(user.id)
                .fetch_optional(&self.pool)
                .instrument(db_span("SELECT", query))
                .await?;
            Ok(row.map(|row| row.get("password_hash")))
        })
        .await?;

        let Some(hash) = hash else {
            return Ok(false);
        };
        // Argon2 is CPU bound; keep it off the async workers.
        let password = password.to_string();
        tokio::task::spawn_blocking(move || verify_password_hash(&password, &hash))
            .await
            .map_err(|err| StoreError::Unavailable(format!("password verification task: {err}")))?
            .map_err(|err| StoreError::Unavailable(err.to_string()))
    }
}
