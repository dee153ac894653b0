use axum::{
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use std::time::Duration;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Unknown account or wrong password. The two are deliberately indistinguishable.
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Access token expired")]
    TokenExpired,

    /// Signature does not verify, or the token names a key id we do not hold
    #[error("Access token signature is invalid")]
    TokenInvalidSignature,

    #[error("Access token is not yet valid")]
    TokenNotYetValid,

    #[error("Access token {claim} does not match")]
    IssuerOrAudienceMismatch { claim: &'static str },

    /// Not a structurally valid token (bad encoding, missing claims, disallowed algorithm)
    #[error("Access token is malformed: {reason}")]
    TokenMalformed { reason: String },

    /// Unknown, revoked, already-consumed and expired refresh tokens all land here
    #[error("Refresh token not found or expired")]
    RefreshTokenNotFoundOrExpired,

    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("OIDC state is invalid or expired")]
    OidcStateInvalidOrExpired,

    #[error("OIDC nonce mismatch")]
    OidcNonceMismatch,

    #[error("Identity token rejected: {reason}")]
    InvalidIdentityToken { reason: String },

    #[error("Authorization code exchange failed: {reason}")]
    UpstreamExchangeFailed { reason: String },

    #[error("No local account is provisioned for this federated identity")]
    UserNotProvisioned,

    /// Invalid request data
    #[error("{message}")]
    BadRequest { message: String },

    #[error("{feature} is disabled")]
    FeatureDisabled { feature: &'static str },

    /// A shared backing store could not be reached in time
    #[error("{store} store unavailable: {source}")]
    StoreUnavailable {
        store: &'static str,
        #[source]
        source: StoreError,
    },

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },
}

/// Failure of a backing store, kept apart from logical validation failures so callers can decide
/// how to degrade (the rate limiter applies its fail policy, everything else reports 503).
#[derive(ThisError, Debug)]
pub enum StoreError {
    #[error("operation exceeded its {0:?} deadline")]
    Timeout(Duration),

    #[error(transparent)]
    Backend(#[from] sqlx::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidCredentials
            | Error::TokenExpired
            | Error::TokenInvalidSignature
            | Error::TokenNotYetValid
            | Error::IssuerOrAudienceMismatch { .. }
            | Error::TokenMalformed { .. }
            | Error::RefreshTokenNotFoundOrExpired
            | Error::OidcStateInvalidOrExpired
            | Error::OidcNonceMismatch
            | Error::InvalidIdentityToken { .. }
            | Error::UpstreamExchangeFailed { .. }
            | Error::UserNotProvisioned => StatusCode::UNAUTHORIZED,
            Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::FeatureDisabled { .. } => StatusCode::NOT_FOUND,
            Error::StoreUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details.
    ///
    /// Credential and token failures collapse into two messages so that responses never reveal
    /// whether an account exists or which check failed. Federated failures never echo the
    /// provider's own error text.
    pub fn user_message(&self) -> String {
        match self {
            Error::InvalidCredentials => "Invalid email or password".to_string(),
            Error::TokenExpired
            | Error::TokenInvalidSignature
            | Error::TokenNotYetValid
            | Error::IssuerOrAudienceMismatch { .. }
            | Error::TokenMalformed { .. }
            | Error::RefreshTokenNotFoundOrExpired => "Authentication required".to_string(),
            Error::RateLimited { .. } => "Too many requests. Please retry later.".to_string(),
            Error::OidcStateInvalidOrExpired
            | Error::OidcNonceMismatch
            | Error::InvalidIdentityToken { .. }
            | Error::UpstreamExchangeFailed { .. }
            | Error::UserNotProvisioned => "Federated login failed".to_string(),
            Error::BadRequest { message } => message.clone(),
            Error::FeatureDisabled { .. } => "Not found".to_string(),
            Error::StoreUnavailable { .. } => "Service temporarily unavailable".to_string(),
            Error::Internal { .. } => "Internal server error".to_string(),
        }
    }

    /// Whole seconds a client should wait before retrying, rounded up.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Error::RateLimited { retry_after } => {
                let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
                Some(secs.max(1))
            }
            _ => None,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Log full error details for debugging - different log levels based on severity
        match &self {
            Error::Internal { .. } => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::StoreUnavailable { .. } => {
                tracing::warn!("Backing store error: {:#}", self);
            }
            Error::BadRequest { .. } | Error::FeatureDisabled { .. } => {
                tracing::debug!("Client error: {}", self);
            }
            _ => {
                tracing::info!("Authentication error: {}", self);
            }
        }

        let status = self.status_code();
        let user_message = self.user_message();

        match self.retry_after_secs() {
            Some(secs) => (status, [(header::RETRY_AFTER, secs.to_string())], user_message).into_response(),
            None => (status, user_message).into_response(),
        }
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_failures_share_one_message() {
        let token_errors = [
            Error::TokenExpired,
            Error::TokenInvalidSignature,
            Error::TokenNotYetValid,
            Error::IssuerOrAudienceMismatch { claim: "iss" },
            Error::RefreshTokenNotFoundOrExpired,
        ];
        for err in token_errors {
            assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
            assert_eq!(err.user_message(), "Authentication required");
        }
        assert_eq!(Error::InvalidCredentials.user_message(), "Invalid email or password");
    }

    #[test]
    fn test_federated_failures_do_not_echo_provider_details() {
        let err = Error::UpstreamExchangeFailed {
            reason: "invalid_grant: AADSTS54005 code already redeemed".to_string(),
        };
        assert_eq!(err.user_message(), "Federated login failed");
        assert!(!err.user_message().contains("AADSTS"));
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let err = Error::RateLimited {
            retry_after: Duration::from_millis(1200),
        };
        assert_eq!(err.retry_after_secs(), Some(2));

        let err = Error::RateLimited {
            retry_after: Duration::from_millis(10),
        };
        assert_eq!(err.retry_after_secs(), Some(1));

        assert_eq!(Error::TokenExpired.retry_after_secs(), None);
    }

    #[test]
    fn test_rate_limited_response_carries_retry_after_header() {
        let response = Error::RateLimited {
            retry_after: Duration::from_secs(3),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "3");
    }

    #[test]
    fn test_store_failures_are_distinct_from_auth_failures() {
        let err = Error::StoreUnavailable {
            store: "refresh_token",
            source: StoreError::Timeout(Duration::from_millis(250)),
        };
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.user_message(), "Service temporarily unavailable");
    }
}
