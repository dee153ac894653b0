//! Refresh token records shared between instances through PostgreSQL.
//!
//! Expiry is evaluated against the database clock so every instance agrees on it.

use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;

use super::RefreshTokenBackend;
use crate::errors::StoreError;
use crate::types::SubjectId;

#[derive(Debug, Clone)]
pub struct PostgresRefreshBackend {
    pool: PgPool,
}

impl PostgresRefreshBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RefreshTokenBackend for PostgresRefreshBackend {
    async fn insert(&self, token_hash: &str, subject: SubjectId, ttl: Duration) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO refresh_tokens (token_hash, subject, expires_at)
             VALUES ($1, $2, now() + make_interval(secs => $3))",
        )
        .bind(token_hash)
        .bind(subject)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn lookup(&self, token_hash: &str) -> Result<Option<SubjectId>, StoreError> {
        let subject = sqlx::query_scalar::<_, SubjectId>(
            "SELECT subject FROM refresh_tokens
             WHERE token_hash = $1 AND revoked_at IS NULL AND expires_at > now()",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(subject)
    }

    async fn rotate(&self, old_hash: &str, new_hash: &str, ttl: Duration) -> Result<Option<SubjectId>, StoreError> {
        // The row lock taken by the UPDATE serialises concurrent rotations of the same token; the
        // loser re-evaluates `revoked_at IS NULL`, matches nothing and inserts nothing.
        let subject = sqlx::query_scalar::<_, SubjectId>(
            "WITH consumed AS (
                 UPDATE refresh_tokens SET revoked_at = now()
                 WHERE token_hash = $1 AND revoked_at IS NULL AND expires_at > now()
                 RETURNING subject
             )
             INSERT INTO refresh_tokens (token_hash, subject, expires_at)
             SELECT $2, subject, now() + make_interval(secs => $3) FROM consumed
             RETURNING subject",
        )
        .bind(old_hash)
        .bind(new_hash)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;
        Ok(subject)
    }

    async fn revoke(&self, token_hash: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE refresh_tokens SET revoked_at = now() WHERE token_hash = $1 AND revoked_at IS NULL")
            .bind(token_hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at <= now() OR revoked_at IS NOT NULL")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
