//! Read access to local accounts.
//!
//! Accounts are owned elsewhere; login only needs to look one up by subject or by email.

use async_trait::async_trait;
use std::fmt::{self, Debug};

use crate::errors::Result;
use crate::types::{Role, SubjectId};

/// What login needs to know about a local account.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub subject: SubjectId,
    pub email: String,
    /// None for accounts that can only sign in through the identity provider
    pub password_hash: Option<String>,
    pub role: Role,
}

impl Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("subject", &self.subject)
            .field("email", &self.email)
            .field("password_hash", &self.password_hash.as_ref().map(|_| "<redacted>"))
            .field("role", &self.role)
            .finish()
    }
}

#[async_trait]
pub trait CredentialRepository: Debug + Send + Sync {
    async fn get_by_subject(&self, subject: SubjectId) -> Result<Option<Credential>>;

    /// Look up an account by email, compared case-insensitively.
    async fn get_by_email(&self, email: &str) -> Result<Option<Credential>>;
}
