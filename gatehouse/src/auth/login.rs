//! Login flows: local password, federated (OIDC authorization code + PKCE), refresh and logout.
//!
//! Every flow either completes and hands back a full [`TokenPair`] or fails with nothing; a
//! failure after some token has already been minted discards it before returning.

use metrics::counter;
use serde::Serialize;
use std::fmt::{self, Debug};
use std::sync::Arc;

use crate::auth::oidc::{AuthorizationRedirect, IdentityProvider, OidcStateStore, StateData, authorization_url};
use crate::auth::password::PasswordHasher;
use crate::auth::refresh::RefreshTokenStore;
use crate::auth::tokens::TokenService;
use crate::auth::utils::{CODE_VERIFIER_BYTES, NONCE_BYTES, STATE_BYTES, pkce_challenge, random_token};
use crate::config::OidcConfig;
use crate::errors::{Error, Result};
use crate::limits::LoginLimiter;
use crate::repository::{Credential, CredentialRepository};
use crate::types::{Role, SubjectId, abbrev_subject};

/// Compared against when the account does not exist, so both failure paths cost one hash.
const DUMMY_PASSWORD: &str = "gatehouse-dummy-password";

/// Credentials returned by a successful login or refresh.
#[derive(Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub token_type: &'static str,
    /// Access token lifetime in seconds
    pub expires_in: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

/// Everything the federated flow needs.
#[derive(Debug, Clone)]
pub struct FederatedLogin {
    pub config: OidcConfig,
    pub states: OidcStateStore,
    pub provider: Arc<dyn IdentityProvider>,
}

#[derive(Debug)]
pub struct Authenticator {
    tokens: Arc<TokenService>,
    credentials: Arc<dyn CredentialRepository>,
    hasher: Arc<dyn PasswordHasher>,
    dummy_hash: String,
    limiter: LoginLimiter,
    refresh: Option<RefreshTokenStore>,
    federation: Option<FederatedLogin>,
}

impl Authenticator {
    /// An authenticator for local password login only. Refresh tokens, rate limiting and federated
    /// login are switched on with the `with_*` methods.
    pub fn new(
        tokens: Arc<TokenService>,
        credentials: Arc<dyn CredentialRepository>,
        hasher: Arc<dyn PasswordHasher>,
    ) -> Result<Self> {
        let dummy_hash = hasher.hash(DUMMY_PASSWORD)?;
        Ok(Self {
            tokens,
            credentials,
            hasher,
            dummy_hash,
            limiter: LoginLimiter::disabled(),
            refresh: None,
            federation: None,
        })
    }

    pub fn with_refresh_tokens(mut self, store: RefreshTokenStore) -> Self {
        self.refresh = Some(store);
        self
    }

    pub fn with_limiter(mut self, limiter: LoginLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_federation(mut self, federation: FederatedLogin) -> Self {
        self.federation = Some(federation);
        self
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    /// Local password login.
    ///
    /// An unknown email and a wrong password fail identically, after the same amount of work.
    #[tracing::instrument(skip_all)]
    pub async fn login(&self, email: &str, password: &str, client_ip: Option<&str>) -> Result<TokenPair> {
        let result = self.login_inner(email, password, client_ip).await;
        record_login("password", &result);
        result
    }

    async fn login_inner(&self, email: &str, password: &str, client_ip: Option<&str>) -> Result<TokenPair> {
        self.limiter.check(client_ip, email).await?;

        if email.trim().is_empty() || password.is_empty() {
            return Err(Error::InvalidCredentials);
        }

        let account = self.credentials.get_by_email(email.trim()).await?;
        let digest = account
            .as_ref()
            .and_then(|account| account.password_hash.clone())
            .unwrap_or_else(|| self.dummy_hash.clone());

        // argon2 is CPU bound, keep it off the async workers
        let hasher = self.hasher.clone();
        let password = password.to_string();
        let matches = tokio::task::spawn_blocking(move || hasher.compare(&digest, &password))
            .await
            .map_err(|e| Error::Internal {
                operation: format!("spawn password verification task: {e}"),
            })??;

        let account = match account {
            Some(account) if matches && account.password_hash.is_some() => account,
            _ => return Err(Error::InvalidCredentials),
        };

        let pair = self.issue_pair(account.subject, account.role).await?;
        tracing::info!(subject = %abbrev_subject(&account.subject), "Password login succeeded");
        Ok(pair)
    }

    /// Start a federated login: remember the handshake secrets and tell the caller where to go.
    #[tracing::instrument(skip_all)]
    pub async fn begin_federated_login(&self) -> Result<AuthorizationRedirect> {
        let federation = self.federation()?;

        let state = random_token(STATE_BYTES);
        let data = StateData {
            code_verifier: random_token(CODE_VERIFIER_BYTES),
            nonce: random_token(NONCE_BYTES),
        };

        let url = authorization_url(&federation.config, &state, &data.nonce, &pkce_challenge(&data.code_verifier))?;
        federation.states.save(&state, &data, federation.config.state_ttl).await?;

        Ok(AuthorizationRedirect { url, state })
    }

    /// Finish a federated login from the provider's callback parameters.
    #[tracing::instrument(skip_all)]
    pub async fn complete_federated_login(&self, state: &str, code: &str) -> Result<TokenPair> {
        let result = self.complete_federated_inner(state, code).await;
        record_login("federated", &result);
        result
    }

    async fn complete_federated_inner(&self, state: &str, code: &str) -> Result<TokenPair> {
        let federation = self.federation()?;

        if state.is_empty() || code.is_empty() {
            return Err(Error::BadRequest {
                message: "missing state or code".to_string(),
            });
        }

        let saved = federation
            .states
            .get_and_delete(state)
            .await?
            .ok_or(Error::OidcStateInvalidOrExpired)?;

        let provider_tokens = federation
            .provider
            .exchange_code(code, &saved.code_verifier)
            .await
            .map_err(|e| Error::UpstreamExchangeFailed { reason: format!("{e:#}") })?;

        let raw_id_token = provider_tokens
            .id_token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| Error::InvalidIdentityToken {
                reason: "provider returned no identity token".to_string(),
            })?;

        let claims = federation
            .provider
            .verify_identity_token(&raw_id_token)
            .await
            .map_err(|e| Error::InvalidIdentityToken { reason: format!("{e:#}") })?;

        if claims.nonce.as_deref() != Some(saved.nonce.as_str()) {
            return Err(Error::OidcNonceMismatch);
        }

        let email = claims
            .email
            .filter(|email| !email.trim().is_empty())
            .ok_or_else(|| Error::InvalidIdentityToken {
                reason: "identity token carries no email".to_string(),
            })?;

        // no implicit account creation
        let account = self
            .credentials
            .get_by_email(email.trim())
            .await?
            .ok_or(Error::UserNotProvisioned)?;

        let pair = self.issue_pair(account.subject, account.role).await?;
        tracing::info!(subject = %abbrev_subject(&account.subject), "Federated login succeeded");
        Ok(pair)
    }

    /// Exchange a refresh token for a new access token (and a new refresh token when rotating).
    ///
    /// The role is re-read from the account, so role changes apply from the next refresh on and a
    /// deleted account can no longer refresh.
    #[tracing::instrument(skip_all)]
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let result = self.refresh_inner(refresh_token).await;
        record_login("refresh", &result);
        result
    }

    async fn refresh_inner(&self, refresh_token: &str) -> Result<TokenPair> {
        let store = self.refresh_store()?;
        let consumed = store.consume(refresh_token).await?;

        let signed = match self.credentials.get_by_subject(consumed.subject).await {
            Ok(Some(Credential { subject, role, .. })) => self.tokens.sign(subject, role),
            Ok(None) => Err(Error::RefreshTokenNotFoundOrExpired),
            Err(e) => Err(e),
        };

        match signed {
            Ok(access_token) => Ok(TokenPair {
                access_token,
                token_type: "Bearer",
                expires_in: self.tokens.ttl().as_secs(),
                refresh_token: consumed.replacement.or_else(|| Some(refresh_token.to_string())),
            }),
            Err(e) => {
                if let Some(replacement) = consumed.replacement {
                    discard_refresh_token(store, &replacement).await;
                }
                Err(e)
            }
        }
    }

    /// Revoke a refresh token. Always succeeds for unknown or already revoked tokens.
    #[tracing::instrument(skip_all)]
    pub async fn logout(&self, refresh_token: &str) -> Result<()> {
        self.refresh_store()?.revoke(refresh_token).await
    }

    async fn issue_pair(&self, subject: SubjectId, role: Role) -> Result<TokenPair> {
        let access_token = self.tokens.sign(subject, role)?;

        let refresh_token = match &self.refresh {
            Some(store) => Some(store.issue(subject, store.ttl()).await?),
            None => None,
        };

        Ok(TokenPair {
            access_token,
            token_type: "Bearer",
            expires_in: self.tokens.ttl().as_secs(),
            refresh_token,
        })
    }

    fn federation(&self) -> Result<&FederatedLogin> {
        self.federation.as_ref().ok_or(Error::FeatureDisabled {
            feature: "federated login",
        })
    }

    fn refresh_store(&self) -> Result<&RefreshTokenStore> {
        self.refresh.as_ref().ok_or(Error::FeatureDisabled {
            feature: "refresh tokens",
        })
    }
}

async fn discard_refresh_token(store: &RefreshTokenStore, token: &str) {
    if let Err(e) = store.revoke(token).await {
        tracing::warn!(error = %e, "Failed to discard unused refresh token");
    }
}

fn record_login(method: &'static str, result: &Result<TokenPair>) {
    let outcome = match result {
        Ok(_) => "success",
        Err(Error::InvalidCredentials) => "invalid_credentials",
        Err(Error::RateLimited { .. }) => "rate_limited",
        Err(Error::RefreshTokenNotFoundOrExpired) => "invalid_refresh_token",
        Err(Error::StoreUnavailable { .. }) => "store_unavailable",
        Err(e) if e.status_code().is_client_error() => "rejected",
        Err(_) => "error",
    };
    counter!("gatehouse_login_total", "method" => method, "outcome" => outcome).increment(1);
}
