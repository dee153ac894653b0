//! Opaque, revocable refresh tokens.
//!
//! [`RefreshTokenStore`] holds the policy (lifetime, rotation, digesting, deadlines) and delegates
//! persistence to a [`RefreshTokenBackend`]. Backends only ever see the SHA-256 digest of a token.
//!
//! Consumption with rotation is one backend operation: the presented token is marked used and its
//! replacement recorded together, so two concurrent refreshes with the same token cannot both
//! succeed and a failed call never leaves the caller holding neither token nor error.

use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::utils::{REFRESH_TOKEN_BYTES, hash_token, random_token};
use crate::errors::{Error, Result, StoreError};
use crate::store::{unavailable, with_deadline};
use crate::sweeper::Sweep;
use crate::types::{SubjectId, abbrev_subject, abbrev_token};

pub mod memory;
pub mod postgres;

pub use memory::MemoryRefreshBackend;
pub use postgres::PostgresRefreshBackend;

const STORE_NAME: &str = "refresh_token";

/// Persistence for refresh token records, keyed by token digest.
///
/// A record is live while it is neither revoked nor consumed and its expiry is in the future.
#[async_trait]
pub trait RefreshTokenBackend: Debug + Send + Sync {
    async fn insert(&self, token_hash: &str, subject: SubjectId, ttl: Duration) -> std::result::Result<(), StoreError>;

    /// Subject of a live record, leaving it live.
    async fn lookup(&self, token_hash: &str) -> std::result::Result<Option<SubjectId>, StoreError>;

    /// Atomically retire a live record and record `new_hash` for the same subject.
    ///
    /// Returns `None`, and records nothing, if `old_hash` was not live.
    async fn rotate(
        &self,
        old_hash: &str,
        new_hash: &str,
        ttl: Duration,
    ) -> std::result::Result<Option<SubjectId>, StoreError>;

    /// Make a record permanently unusable. Unknown digests are ignored.
    async fn revoke(&self, token_hash: &str) -> std::result::Result<(), StoreError>;

    /// Physically remove records that can no longer be used. Returns how many were removed.
    async fn purge_expired(&self) -> std::result::Result<u64, StoreError>;
}

/// Outcome of presenting a refresh token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Consumed {
    pub subject: SubjectId,
    /// The token to use next time, when rotation is enabled. The presented token is dead.
    pub replacement: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RefreshTokenStore {
    backend: Arc<dyn RefreshTokenBackend>,
    ttl: Duration,
    rotation: bool,
    deadline: Duration,
}

impl RefreshTokenStore {
    pub fn new(backend: Arc<dyn RefreshTokenBackend>, ttl: Duration, rotation: bool, deadline: Duration) -> Self {
        Self {
            backend,
            ttl,
            rotation,
            deadline,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn rotation(&self) -> bool {
        self.rotation
    }

    /// Mint a refresh token for `subject` that expires `ttl` from now.
    ///
    /// The token is only returned once the backend has recorded it.
    #[tracing::instrument(skip_all, fields(subject = %abbrev_subject(&subject)))]
    pub async fn issue(&self, subject: SubjectId, ttl: Duration) -> Result<String> {
        if ttl.is_zero() {
            return Err(Error::BadRequest {
                message: "refresh token lifetime must be positive".to_string(),
            });
        }

        let token = random_token(REFRESH_TOKEN_BYTES);
        with_deadline(self.deadline, self.backend.insert(&hash_token(&token), subject, ttl))
            .await
            .map_err(|e| unavailable(STORE_NAME, e))?;

        tracing::debug!(token = %abbrev_token(&token), "Issued refresh token");
        Ok(token)
    }

    /// Validate `token` and, when rotation is enabled, exchange it for a new one.
    ///
    /// Unknown, revoked, consumed and expired tokens are indistinguishable to the caller.
    #[tracing::instrument(skip_all, fields(token = %abbrev_token(token)))]
    pub async fn consume(&self, token: &str) -> Result<Consumed> {
        let token_hash = hash_token(token);

        if !self.rotation {
            let subject = with_deadline(self.deadline, self.backend.lookup(&token_hash))
                .await
                .map_err(|e| unavailable(STORE_NAME, e))?
                .ok_or(Error::RefreshTokenNotFoundOrExpired)?;

            return Ok(Consumed {
                subject,
                replacement: None,
            });
        }

        let replacement = random_token(REFRESH_TOKEN_BYTES);
        let subject = with_deadline(
            self.deadline,
            self.backend.rotate(&token_hash, &hash_token(&replacement), self.ttl),
        )
        .await
        .map_err(|e| unavailable(STORE_NAME, e))?
        .ok_or(Error::RefreshTokenNotFoundOrExpired)?;

        tracing::debug!(subject = %abbrev_subject(&subject), "Rotated refresh token");
        Ok(Consumed {
            subject,
            replacement: Some(replacement),
        })
    }

    /// Revoke `token`. Revoking an unknown or already revoked token succeeds.
    #[tracing::instrument(skip_all, fields(token = %abbrev_token(token)))]
    pub async fn revoke(&self, token: &str) -> Result<()> {
        with_deadline(self.deadline, self.backend.revoke(&hash_token(token)))
            .await
            .map_err(|e| unavailable(STORE_NAME, e))
    }
}

#[async_trait]
impl Sweep for RefreshTokenStore {
    fn name(&self) -> &'static str {
        STORE_NAME
    }

    async fn sweep(&self) -> std::result::Result<u64, StoreError> {
        with_deadline(self.deadline, self.backend.purge_expired()).await
    }
}
