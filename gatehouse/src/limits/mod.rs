//! Admission control for credential endpoints.
//!
//! Each [`RateLimiter`] is a token bucket per key: a bucket holds up to `capacity` tokens, refills
//! continuously at `refill_per_second`, and every admitted request spends one token. Buckets live
//! in a [`BucketStore`], either in process or shared between instances.
//!
//! A [`LoginLimiter`] chains one limiter per keying dimension (client IP, submitted identifier);
//! a request proceeds only if every limiter admits it.
//!
//! When the store cannot be reached the limiter does not report an error. It applies its
//! configured [`FailPolicy`] instead.

use async_trait::async_trait;
use metrics::counter;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{EndpointLimitConfig, FailPolicy};
use crate::errors::{Error, Result, StoreError};
use crate::store::with_deadline;
use crate::sweeper::Sweep;

pub mod memory;
pub mod postgres;

pub use memory::MemoryBucketStore;
pub use postgres::PostgresBucketStore;

/// Shape of one bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketParams {
    pub capacity: u32,
    pub refill_per_second: f64,
}

impl BucketParams {
    /// Time an empty bucket takes to refill completely. A bucket untouched for this long is
    /// indistinguishable from one that was never created.
    pub fn full_refill(&self) -> Duration {
        Duration::try_from_secs_f64(f64::from(self.capacity) / self.refill_per_second).unwrap_or(Duration::MAX)
    }

    /// Time until a bucket holding `tokens` has a whole token again.
    pub fn retry_after(&self, tokens: f64) -> Duration {
        let missing = (1.0 - tokens).max(0.0);
        Duration::try_from_secs_f64(missing / self.refill_per_second).unwrap_or(Duration::MAX)
    }
}

/// Result of one refill-and-take step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Admission {
    pub allowed: bool,
    /// Zero when allowed
    pub retry_after: Duration,
}

/// Storage for token buckets. `take` must refill, check and deduct as one atomic step.
#[async_trait]
pub trait BucketStore: Debug + Send + Sync {
    async fn take(&self, key: &str, params: BucketParams) -> std::result::Result<Admission, StoreError>;

    /// Drop buckets not touched for `idle_for`. Returns how many were removed.
    async fn purge_idle(&self, idle_for: Duration) -> std::result::Result<u64, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited { retry_after: Duration },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed)
    }
}

/// One token bucket per identifier within a scope and dimension, e.g. `login` by `ip`.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    scope: String,
    dimension: &'static str,
    params: BucketParams,
    fail_policy: FailPolicy,
    store: Arc<dyn BucketStore>,
    deadline: Duration,
}

impl RateLimiter {
    pub fn new(
        scope: impl Into<String>,
        dimension: &'static str,
        params: BucketParams,
        fail_policy: FailPolicy,
        store: Arc<dyn BucketStore>,
        deadline: Duration,
    ) -> Self {
        Self {
            scope: scope.into(),
            dimension,
            params,
            fail_policy,
            store,
            deadline,
        }
    }

    pub fn params(&self) -> BucketParams {
        self.params
    }

    fn key(&self, identifier: &str) -> String {
        format!("{}:{}:{}", self.scope, self.dimension, identifier)
    }

    /// Spend one token from `identifier`'s bucket if one is available.
    pub async fn allow(&self, identifier: &str) -> RateLimitDecision {
        let key = self.key(identifier);

        let decision = match with_deadline(self.deadline, self.store.take(&key, self.params)).await {
            Ok(admission) if admission.allowed => RateLimitDecision::Allowed,
            Ok(admission) => RateLimitDecision::Limited {
                retry_after: admission.retry_after,
            },
            Err(e) => {
                counter!("gatehouse_store_failures_total", "store" => "rate_limit").increment(1);
                match self.fail_policy {
                    FailPolicy::Open => {
                        tracing::warn!(scope = %self.scope, dimension = self.dimension, error = %e, "Rate limit store unavailable, failing open");
                        RateLimitDecision::Allowed
                    }
                    FailPolicy::Closed => {
                        tracing::warn!(scope = %self.scope, dimension = self.dimension, error = %e, "Rate limit store unavailable, failing closed");
                        RateLimitDecision::Limited {
                            retry_after: Duration::from_secs(1),
                        }
                    }
                }
            }
        };

        let label = if decision.is_allowed() { "allowed" } else { "limited" };
        counter!(
            "gatehouse_rate_limit_total",
            "scope" => self.scope.clone(),
            "dimension" => self.dimension,
            "decision" => label
        )
        .increment(1);

        decision
    }
}

/// The limiter chain in front of the login endpoint.
#[derive(Debug, Clone, Default)]
pub struct LoginLimiter {
    by_ip: Option<RateLimiter>,
    by_identifier: Option<RateLimiter>,
}

impl LoginLimiter {
    /// A chain that admits everything.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn new(config: &EndpointLimitConfig, store: Arc<dyn BucketStore>, deadline: Duration) -> Self {
        if !config.enabled {
            return Self::disabled();
        }

        let params = BucketParams {
            capacity: config.capacity,
            refill_per_second: config.refill_per_second,
        };
        let limiter =
            |dimension| RateLimiter::new("login", dimension, params, config.fail_policy, store.clone(), deadline);

        Self {
            by_ip: config.per_ip.then(|| limiter("ip")),
            by_identifier: config.per_identifier.then(|| limiter("identifier")),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.by_ip.is_some() || self.by_identifier.is_some()
    }

    /// Admit a login attempt from `client_ip` for `identifier`, or explain how long to wait.
    ///
    /// Requests without a known client IP skip the per-IP bucket. Identifiers are compared
    /// case-insensitively so `Alice@x` and `alice@x` share a bucket.
    pub async fn check(&self, client_ip: Option<&str>, identifier: &str) -> Result<()> {
        if let (Some(limiter), Some(ip)) = (&self.by_ip, client_ip) {
            if let RateLimitDecision::Limited { retry_after } = limiter.allow(ip).await {
                tracing::info!(dimension = "ip", "Login attempt rate limited");
                return Err(Error::RateLimited { retry_after });
            }
        }

        if let Some(limiter) = &self.by_identifier {
            let normalized = identifier.trim().to_lowercase();
            if let RateLimitDecision::Limited { retry_after } = limiter.allow(&normalized).await {
                tracing::info!(dimension = "identifier", "Login attempt rate limited");
                return Err(Error::RateLimited { retry_after });
            }
        }

        Ok(())
    }
}

/// Purges buckets that have been idle long enough to be full again.
#[derive(Debug, Clone)]
pub struct BucketSweep {
    store: Arc<dyn BucketStore>,
    idle_for: Duration,
    deadline: Duration,
}

impl BucketSweep {
    pub fn new(store: Arc<dyn BucketStore>, params: BucketParams, deadline: Duration) -> Self {
        Self {
            store,
            idle_for: params.full_refill(),
            deadline,
        }
    }
}

#[async_trait]
impl Sweep for BucketSweep {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn sweep(&self) -> std::result::Result<u64, StoreError> {
        with_deadline(self.deadline, self.store.purge_idle(self.idle_for)).await
    }
}
