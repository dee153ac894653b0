//! Token buckets shared between instances through PostgreSQL.
//!
//! Refill, check and deduct happen in one upsert, so two instances racing on the same key are
//! serialised by the row lock and can never both spend the last token.

use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;

use super::{Admission, BucketParams, BucketStore};
use crate::errors::StoreError;

/// Each `LEAST(...)` is the existing bucket topped up for the time since its last refill, capped at
/// capacity ($2), with the refill rate in tokens per second in $3.
const TAKE_TOKEN: &str = "
    INSERT INTO rate_limit_buckets AS b (key, tokens, last_refill_at, last_allowed)
    VALUES ($1, $2 - 1, now(), true)
    ON CONFLICT (key) DO UPDATE SET
        tokens = CASE
            WHEN LEAST($2, b.tokens + GREATEST(0, EXTRACT(EPOCH FROM (now() - b.last_refill_at)))::float8 * $3) >= 1
            THEN LEAST($2, b.tokens + GREATEST(0, EXTRACT(EPOCH FROM (now() - b.last_refill_at)))::float8 * $3) - 1
            ELSE LEAST($2, b.tokens + GREATEST(0, EXTRACT(EPOCH FROM (now() - b.last_refill_at)))::float8 * $3)
        END,
        last_refill_at = now(),
        last_allowed =
            LEAST($2, b.tokens + GREATEST(0, EXTRACT(EPOCH FROM (now() - b.last_refill_at)))::float8 * $3) >= 1
    RETURNING tokens, last_allowed";

#[derive(Debug, Clone)]
pub struct PostgresBucketStore {
    pool: PgPool,
}

impl PostgresBucketStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BucketStore for PostgresBucketStore {
    async fn take(&self, key: &str, params: BucketParams) -> Result<Admission, StoreError> {
        let (tokens, allowed) = sqlx::query_as::<_, (f64, bool)>(TAKE_TOKEN)
            .bind(key)
            .bind(f64::from(params.capacity))
            .bind(params.refill_per_second)
            .fetch_one(&self.pool)
            .await?;

        Ok(Admission {
            allowed,
            retry_after: if allowed {
                Duration::ZERO
            } else {
                params.retry_after(tokens)
            },
        })
    }

    async fn purge_idle(&self, idle_for: Duration) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM rate_limit_buckets WHERE last_refill_at <= now() - make_interval(secs => $1)")
            .bind(idle_for.as_secs_f64())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
