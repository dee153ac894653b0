//! Federated login handshake state and the identity provider seam.
//!
//! Starting a federated login stores a [`StateData`] (PKCE verifier and nonce) under a random
//! `state` value that round-trips through the provider. The callback takes it back out with
//! [`OidcStateStore::get_and_delete`], which removes the entry in the same step that reads it, so a
//! replayed callback finds nothing. Expired entries are never returned, whether or not the sweeper
//! has removed them yet.

use async_trait::async_trait;
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::config::OidcConfig;
use crate::errors::{Error, Result, StoreError};
use crate::store::{unavailable, with_deadline};
use crate::sweeper::Sweep;
use crate::types::abbrev_token;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStateBackend;
pub use postgres::PostgresStateBackend;

const STORE_NAME: &str = "oidc_state";

/// Secrets bound to one login handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct StateData {
    pub code_verifier: String,
    pub nonce: String,
}

impl Debug for StateData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateData")
            .field("code_verifier", &abbrev_token(&self.code_verifier))
            .field("nonce", &abbrev_token(&self.nonce))
            .finish()
    }
}

/// Persistence for handshake state, keyed by the opaque `state` value.
#[async_trait]
pub trait StateBackend: Debug + Send + Sync {
    async fn save(&self, state: &str, data: &StateData, ttl: Duration) -> std::result::Result<(), StoreError>;

    /// Remove the entry and return it if it had not yet expired. An expired entry is removed too.
    async fn take(&self, state: &str) -> std::result::Result<Option<StateData>, StoreError>;

    async fn purge_expired(&self) -> std::result::Result<u64, StoreError>;
}

#[derive(Debug, Clone)]
pub struct OidcStateStore {
    backend: Arc<dyn StateBackend>,
    deadline: Duration,
}

impl OidcStateStore {
    pub fn new(backend: Arc<dyn StateBackend>, deadline: Duration) -> Self {
        Self { backend, deadline }
    }

    pub async fn save(&self, state: &str, data: &StateData, ttl: Duration) -> Result<()> {
        if ttl.is_zero() {
            return Err(Error::BadRequest {
                message: "OIDC state lifetime must be positive".to_string(),
            });
        }

        with_deadline(self.deadline, self.backend.save(state, data, ttl))
            .await
            .map_err(|e| unavailable(STORE_NAME, e))
    }

    /// Retrieve and remove the handshake saved under `state`. At most one caller ever gets it.
    pub async fn get_and_delete(&self, state: &str) -> Result<Option<StateData>> {
        with_deadline(self.deadline, self.backend.take(state))
            .await
            .map_err(|e| unavailable(STORE_NAME, e))
    }
}

#[async_trait]
impl Sweep for OidcStateStore {
    fn name(&self) -> &'static str {
        STORE_NAME
    }

    async fn sweep(&self) -> std::result::Result<u64, StoreError> {
        with_deadline(self.deadline, self.backend.purge_expired()).await
    }
}

/// Tokens returned by the provider's token endpoint.
#[derive(Clone, Default)]
pub struct ProviderTokens {
    pub id_token: Option<String>,
}

impl Debug for ProviderTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderTokens")
            .field("id_token", &self.id_token.as_deref().map(abbrev_token))
            .finish()
    }
}

/// Claims from a verified identity token that login needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityClaims {
    pub email: Option<String>,
    pub nonce: Option<String>,
}

/// The external OpenID Connect provider. Discovery, JWKS handling and identity token signature
/// checks all live behind this trait.
#[async_trait]
pub trait IdentityProvider: Debug + Send + Sync {
    /// Redeem an authorization code, proving possession of the PKCE verifier.
    async fn exchange_code(&self, code: &str, code_verifier: &str) -> anyhow::Result<ProviderTokens>;

    /// Check an identity token's signature and standard claims, returning what it asserts.
    async fn verify_identity_token(&self, raw: &str) -> anyhow::Result<IdentityClaims>;
}

/// Where to send the caller to start a federated login.
#[derive(Debug, Clone)]
pub struct AuthorizationRedirect {
    pub url: Url,
    pub state: String,
}

/// Build the provider authorization URL for one handshake, using the PKCE `S256` method.
pub fn authorization_url(config: &OidcConfig, state: &str, nonce: &str, code_challenge: &str) -> Result<Url> {
    let mut url = config.authorization_endpoint.clone().ok_or_else(|| Error::Internal {
        operation: "build authorization URL: oidc.authorization_endpoint is not configured".to_string(),
    })?;
    let redirect = config.redirect_url.as_ref().ok_or_else(|| Error::Internal {
        operation: "build authorization URL: oidc.redirect_url is not configured".to_string(),
    })?;

    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", &config.client_id)
        .append_pair("redirect_uri", redirect.as_str())
        .append_pair("scope", &config.scopes.join(" "))
        .append_pair("state", state)
        .append_pair("nonce", nonce)
        .append_pair("code_challenge", code_challenge)
        .append_pair("code_challenge_method", "S256");

    Ok(url)
}
