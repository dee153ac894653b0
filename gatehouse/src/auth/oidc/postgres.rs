//! Handshake state shared between instances through PostgreSQL, so a callback may land on a
//! different instance from the one that started the login.

use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;

use super::{StateBackend, StateData};
use crate::errors::StoreError;

#[derive(Debug, Clone)]
pub struct PostgresStateBackend {
    pool: PgPool,
}

impl PostgresStateBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StateBackend for PostgresStateBackend {
    async fn save(&self, state: &str, data: &StateData, ttl: Duration) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO oidc_states (state, code_verifier, nonce, expires_at)
             VALUES ($1, $2, $3, now() + make_interval(secs => $4))",
        )
        .bind(state)
        .bind(&data.code_verifier)
        .bind(&data.nonce)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn take(&self, state: &str) -> Result<Option<StateData>, StoreError> {
        let row = sqlx::query_as::<_, (String, String, bool)>(
            "DELETE FROM oidc_states WHERE state = $1
             RETURNING code_verifier, nonce, expires_at > now()",
        )
        .bind(state)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .filter(|(_, _, live)| *live)
            .map(|(code_verifier, nonce, _)| StateData { code_verifier, nonce }))
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM oidc_states WHERE expires_at <= now()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::oidc::OidcStateStore;
    use std::sync::Arc;

    #[sqlx::test(migrations = "./migrations")]
    #[test_log::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_state_is_consumed_once(pool: PgPool) {
        let store = OidcStateStore::new(Arc::new(PostgresStateBackend::new(pool)), Duration::from_secs(5));
        let data = StateData {
            code_verifier: "v".to_string(),
            nonce: "n".to_string(),
        };

        store.save("abc", &data, Duration::from_secs(600)).await.unwrap();
        let (a, b) = tokio::join!(store.get_and_delete("abc"), store.get_and_delete("abc"));
        assert!(a.unwrap().is_some() ^ b.unwrap().is_some());
    }

    #[sqlx::test(migrations = "./migrations")]
    #[test_log::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_expired_state_is_deleted_but_not_returned(pool: PgPool) {
        let backend = PostgresStateBackend::new(pool.clone());
        let data = StateData {
            code_verifier: "v".to_string(),
            nonce: "n".to_string(),
        };

        sqlx::query(
            "INSERT INTO oidc_states (state, code_verifier, nonce, expires_at) VALUES ('old', 'v', 'n', now() - interval '1 second')",
        )
        .execute(&pool)
        .await
        .unwrap();
        backend.save("fresh", &data, Duration::from_secs(600)).await.unwrap();

        assert_eq!(backend.take("old").await.unwrap(), None);
        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM oidc_states")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(remaining, 1);
        assert_eq!(backend.purge_expired().await.unwrap(), 0);
    }
}
