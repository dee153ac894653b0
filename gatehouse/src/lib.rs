//! # gatehouse: authentication and session state for multi-instance services
//!
//! `gatehouse` issues and verifies access tokens, keeps refresh tokens, rate limits credential
//! endpoints and holds the short-lived state of federated (OpenID Connect) logins. It is built so
//! that several instances of a service can run side by side: every piece of shared mutable state
//! lives behind a store trait with a process-local variant for single-instance deployments and a
//! PostgreSQL variant for everything else.
//!
//! ## Components
//!
//! - [`auth::tokens::TokenService`] signs and verifies access tokens, with key rotation.
//! - [`auth::refresh::RefreshTokenStore`] issues, consumes (optionally rotating) and revokes
//!   refresh tokens.
//! - [`limits::LoginLimiter`] chains per-IP and per-identifier token buckets in front of login.
//! - [`auth::oidc::OidcStateStore`] keeps PKCE verifiers and nonces between the redirect and the
//!   callback, handing each one out at most once.
//! - [`auth::login::Authenticator`] ties these together into the login, federated login, refresh
//!   and logout flows. It never returns a partial set of tokens.
//!
//! ## Lifecycle
//!
//! Everything is constructed explicitly from [`Config`] by [`AuthServices::new`], which also starts
//! the background sweepers that purge expired state. [`AuthServices::shutdown`] stops them and
//! waits for them to exit. Account lookup and the identity provider are supplied by the embedding
//! service when it asks for an [`Authenticator`](auth::login::Authenticator).

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::info;

pub mod auth;
pub mod clock;
pub mod config;
pub mod errors;
pub mod limits;
pub mod repository;
pub mod store;
pub mod sweeper;
pub mod telemetry;
pub mod types;

#[cfg(test)]
pub mod test_utils;

pub use config::Config;

use auth::login::{Authenticator, FederatedLogin};
use auth::oidc::{IdentityProvider, MemoryStateBackend, OidcStateStore, PostgresStateBackend, StateBackend};
use auth::password::PasswordHasher;
use auth::refresh::{MemoryRefreshBackend, PostgresRefreshBackend, RefreshTokenBackend, RefreshTokenStore};
use auth::tokens::TokenService;
use clock::{SharedClock, SystemClock};
use config::StoreBackend;
use errors::Error;
use limits::{BucketParams, BucketStore, BucketSweep, LoginLimiter, MemoryBucketStore, PostgresBucketStore};
use repository::CredentialRepository;
use sweeper::{Sweep, Sweeper};

/// Get the gatehouse database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// Every long-lived authentication component, built once at startup.
///
/// Dropping this cancels the sweepers through the drop guard; [`AuthServices::shutdown`] also
/// waits for them to finish.
pub struct AuthServices {
    config: Config,
    pub tokens: Arc<TokenService>,
    pub refresh: Option<RefreshTokenStore>,
    pub login_limiter: LoginLimiter,
    pub oidc_states: Option<OidcStateStore>,
    pool: Option<PgPool>,
    sweepers: Vec<Sweeper>,
    shutdown_token: CancellationToken,
    // Pub so that we can disarm it if we want to
    pub drop_guard: Option<DropGuard>,
}

impl AuthServices {
    /// Build every component from `config`, connecting to the shared store when it is configured.
    ///
    /// Fails if a signing key cannot be loaded or the shared store cannot be reached.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let pool = match config.store.backend {
            StoreBackend::Postgres => Some(store::connect(&config.store).await?),
            StoreBackend::Memory => None,
        };
        Self::new_with_pool(config, pool, Arc::new(SystemClock))
    }

    /// Build from an existing pool (or none, for the memory backend) and clock.
    pub fn new_with_pool(config: Config, pool: Option<PgPool>, clock: SharedClock) -> anyhow::Result<Self> {
        let tokens = Arc::new(TokenService::new(&config.tokens, clock.clone())?);
        let deadline = config.store.operation_timeout;

        let (refresh_backend, bucket_store, state_backend) = match (config.store.backend, &pool) {
            (StoreBackend::Postgres, Some(pool)) => (
                Arc::new(PostgresRefreshBackend::new(pool.clone())) as Arc<dyn RefreshTokenBackend>,
                Arc::new(PostgresBucketStore::new(pool.clone())) as Arc<dyn BucketStore>,
                Arc::new(PostgresStateBackend::new(pool.clone())) as Arc<dyn StateBackend>,
            ),
            (StoreBackend::Postgres, None) => {
                anyhow::bail!("store.backend is postgres but no connection pool was provided")
            }
            (StoreBackend::Memory, _) => (
                Arc::new(MemoryRefreshBackend::new(clock.clone())) as Arc<dyn RefreshTokenBackend>,
                Arc::new(MemoryBucketStore::new(clock.clone())) as Arc<dyn BucketStore>,
                Arc::new(MemoryStateBackend::new(clock.clone())) as Arc<dyn StateBackend>,
            ),
        };

        let shutdown_token = CancellationToken::new();
        let drop_guard = shutdown_token.clone().drop_guard();
        let mut sweepers = Vec::new();
        let mut start_sweeper = |target: Arc<dyn Sweep>, interval: Duration| {
            sweepers.push(Sweeper::start_with_shutdown(target, interval, shutdown_token.clone()));
        };

        let refresh = config.refresh.enabled.then(|| {
            RefreshTokenStore::new(refresh_backend, config.refresh.ttl, config.refresh.rotation, deadline)
        });
        if let Some(store) = &refresh {
            start_sweeper(Arc::new(store.clone()), config.store.sweep_interval);
        }

        let login_config = &config.rate_limit.login;
        let login_limiter = LoginLimiter::new(login_config, bucket_store.clone(), deadline);
        if login_limiter.is_enabled() {
            let params = BucketParams {
                capacity: login_config.capacity,
                refill_per_second: login_config.refill_per_second,
            };
            start_sweeper(
                Arc::new(BucketSweep::new(bucket_store, params, deadline)),
                config.store.sweep_interval,
            );
        }

        let oidc_states = config
            .oidc
            .enabled
            .then(|| OidcStateStore::new(state_backend, deadline));
        if let Some(states) = &oidc_states {
            start_sweeper(Arc::new(states.clone()), config.oidc.sweep_interval);
        }

        info!(
            backend = ?config.store.backend,
            active_key = %tokens.active_key_id(),
            refresh = refresh.is_some(),
            rate_limit = login_limiter.is_enabled(),
            oidc = oidc_states.is_some(),
            sweepers = sweepers.len(),
            "Authentication services started"
        );

        Ok(Self {
            config,
            tokens,
            refresh,
            login_limiter,
            oidc_states,
            pool,
            sweepers,
            shutdown_token,
            drop_guard: Some(drop_guard),
        })
    }

    /// An [`Authenticator`] over these services.
    ///
    /// `provider` is required when OIDC is enabled and ignored otherwise.
    pub fn authenticator(
        &self,
        credentials: Arc<dyn CredentialRepository>,
        hasher: Arc<dyn PasswordHasher>,
        provider: Option<Arc<dyn IdentityProvider>>,
    ) -> errors::Result<Authenticator> {
        let mut authenticator =
            Authenticator::new(self.tokens.clone(), credentials, hasher)?.with_limiter(self.login_limiter.clone());

        if let Some(store) = &self.refresh {
            authenticator = authenticator.with_refresh_tokens(store.clone());
        }

        if let Some(states) = &self.oidc_states {
            let provider = provider.ok_or_else(|| Error::Internal {
                operation: "build authenticator: OIDC is enabled but no identity provider was supplied".to_string(),
            })?;
            authenticator = authenticator.with_federation(FederatedLogin {
                config: self.config.oidc.clone(),
                states: states.clone(),
                provider,
            });
        }

        Ok(authenticator)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> Option<&PgPool> {
        self.pool.as_ref()
    }

    /// Names of the running sweepers, for diagnostics.
    pub fn sweepers(&self) -> Vec<&'static str> {
        self.sweepers.iter().map(Sweeper::name).collect()
    }

    /// Stop every sweeper and wait for it to exit
    pub async fn shutdown(mut self) {
        self.shutdown_token.cancel();
        for sweeper in std::mem::take(&mut self.sweepers) {
            sweeper.stop().await;
        }
        info!("Authentication services stopped");
    }
}

impl std::fmt::Debug for AuthServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthServices")
            .field("backend", &self.config.store.backend)
            .field("refresh", &self.refresh.is_some())
            .field("rate_limit", &self.login_limiter.is_enabled())
            .field("oidc", &self.oidc_states.is_some())
            .field("sweepers", &self.sweepers)
            .finish_non_exhaustive()
    }
}
