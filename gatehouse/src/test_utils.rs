//! Shared fixtures for unit tests.

use anyhow::anyhow;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Mutex;
use url::Url;
use uuid::Uuid;

use crate::auth::oidc::{IdentityClaims, IdentityProvider, ProviderTokens};
use crate::auth::password::{Argon2Hasher, Argon2Params, PasswordHasher};
use crate::config::{Config, OidcConfig, SigningKeyConfig};
use crate::errors::Result;
use crate::repository::{Credential, CredentialRepository};
use crate::types::{Role, SubjectId};

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.tokens.keys = vec![SigningKeyConfig::hmac("primary", "test-secret-key-for-jwt-signing")];
    config
}

pub fn test_oidc_config() -> OidcConfig {
    OidcConfig {
        enabled: true,
        client_id: "gatehouse-test".to_string(),
        redirect_url: Some(Url::parse("https://app.example.com/auth/oidc/callback").unwrap()),
        authorization_endpoint: Some(Url::parse("https://idp.example.com/authorize").unwrap()),
        ..Default::default()
    }
}

/// Argon2id with parameters cheap enough for tests.
pub fn fast_hasher() -> Argon2Hasher {
    Argon2Hasher::new(Argon2Params {
        memory_kib: 1024,
        iterations: 1,
        parallelism: 1,
    })
}

#[derive(Debug, Default)]
pub struct InMemoryCredentials {
    accounts: DashMap<SubjectId, Credential>,
}

impl InMemoryCredentials {
    /// Add an account and return its subject id. `None` makes it a federated-only account.
    pub fn add(&self, email: &str, password: Option<&str>, role: Role) -> SubjectId {
        let subject = Uuid::new_v4();
        let password_hash = password.map(|p| fast_hasher().hash(p).unwrap());
        self.accounts.insert(
            subject,
            Credential {
                subject,
                email: email.to_string(),
                password_hash,
                role,
            },
        );
        subject
    }

    pub fn set_role(&self, subject: SubjectId, role: Role) {
        self.accounts.get_mut(&subject).unwrap().role = role;
    }

    pub fn remove(&self, subject: SubjectId) {
        self.accounts.remove(&subject);
    }
}

#[async_trait]
impl CredentialRepository for InMemoryCredentials {
    async fn get_by_subject(&self, subject: SubjectId) -> Result<Option<Credential>> {
        Ok(self.accounts.get(&subject).map(|entry| entry.clone()))
    }

    async fn get_by_email(&self, email: &str) -> Result<Option<Credential>> {
        Ok(self
            .accounts
            .iter()
            .find(|entry| entry.email.eq_ignore_ascii_case(email))
            .map(|entry| entry.clone()))
    }
}

/// An identity provider answering from a script of `code -> tokens` and `id_token -> claims`.
///
/// `respond_with` scripts both steps at once: the code exchanges for an identity token named after
/// the code, which verifies to the given claims.
#[derive(Debug, Default)]
pub struct FakeIdentityProvider {
    exchanges: DashMap<String, ProviderTokens>,
    identities: DashMap<String, IdentityClaims>,
    last_code_verifier: Mutex<Option<String>>,
}

impl FakeIdentityProvider {
    pub fn respond_with(&self, code: &str, claims: IdentityClaims) {
        let id_token = format!("id-token-for-{code}");
        self.exchanges.insert(
            code.to_string(),
            ProviderTokens {
                id_token: Some(id_token.clone()),
            },
        );
        self.identities.insert(id_token, claims);
    }

    pub fn respond_with_tokens(&self, code: &str, tokens: ProviderTokens) {
        self.exchanges.insert(code.to_string(), tokens);
    }

    pub fn last_code_verifier(&self) -> Option<String> {
        self.last_code_verifier.lock().unwrap().clone()
    }
}

#[async_trait]
impl IdentityProvider for FakeIdentityProvider {
    async fn exchange_code(&self, code: &str, code_verifier: &str) -> anyhow::Result<ProviderTokens> {
        *self.last_code_verifier.lock().unwrap() = Some(code_verifier.to_string());
        self.exchanges
            .get(code)
            .map(|tokens| tokens.clone())
            .ok_or_else(|| anyhow!("invalid_grant: unknown authorization code"))
    }

    async fn verify_identity_token(&self, raw: &str) -> anyhow::Result<IdentityClaims> {
        self.identities
            .get(raw)
            .map(|claims| claims.clone())
            .ok_or_else(|| anyhow!("identity token signature does not verify"))
    }
}
