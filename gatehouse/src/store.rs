//! Plumbing shared by the PostgreSQL-backed store variants.

use metrics::counter;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::future::Future;
use std::time::Duration;

use crate::config::StoreConfig;
use crate::errors::{Error, StoreError};

/// Open the connection pool for the shared store and bring its schema up to date.
pub async fn connect(config: &StoreConfig) -> anyhow::Result<PgPool> {
    let url = config
        .url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("store.backend is postgres but no database URL is configured"))?;

    let pool = PgPoolOptions::new()
        .max_connections(config.pool.max_connections)
        .min_connections(config.pool.min_connections)
        .acquire_timeout(Duration::from_secs(config.pool.acquire_timeout_secs))
        .connect(url)
        .await?;

    crate::migrator().run(&pool).await?;
    tracing::info!(max_connections = config.pool.max_connections, "Connected to shared store");

    Ok(pool)
}

/// Run one store round trip under `deadline`.
///
/// Every statement issued through here is a single atomic SQL statement, so dropping it at the
/// deadline leaves the row either fully updated or untouched.
pub(crate) async fn with_deadline<T, E, F>(deadline: Duration, op: F) -> Result<T, StoreError>
where
    E: Into<StoreError>,
    F: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(deadline, op).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(StoreError::Timeout(deadline)),
    }
}

/// Record a store failure and turn it into the error reported to callers.
pub(crate) fn unavailable(store: &'static str, source: StoreError) -> Error {
    counter!("gatehouse_store_failures_total", "store" => store).increment(1);
    tracing::warn!(store, error = %source, "Store operation failed");
    Error::StoreUnavailable { store, source }
}
