//! Access token signing and verification.
//!
//! Access tokens are compact JWTs carrying a subject and role. Every token names the key that
//! signed it in its `kid` header; verification looks that key up in the current [`KeyRing`], so
//! rotating the signing key never invalidates tokens that are still within their lifetime.
//!
//! Expiry and not-before are checked here rather than by `jsonwebtoken`, against the injected
//! [`Clock`](crate::clock::Clock) and with the configured leeway applied to both bounds.

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Header, Validation, decode, decode_header, encode};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::auth::keys::{KeyRing, LoadedKey};
use crate::clock::SharedClock;
use crate::config::{SigningKeyConfig, TokenConfig};
use crate::errors::{Error, Result};
use crate::types::{Principal, Role, SubjectId, abbrev_subject};

/// Claims carried by an access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: SubjectId,
    pub role: Role,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    /// Unique per token, so two tokens minted in the same second still differ
    pub jti: Uuid,
}

impl AccessClaims {
    pub fn principal(&self) -> Principal {
        Principal {
            subject: self.sub,
            role: self.role,
        }
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }
}

#[derive(Debug)]
pub struct TokenService {
    keys: ArcSwap<KeyRing>,
    /// Serialises rotations so two concurrent swaps cannot drop each other's key
    rotation: Mutex<()>,
    issuer: String,
    audience: String,
    ttl: Duration,
    leeway: Duration,
    stamp_not_before: bool,
    clock: SharedClock,
}

impl TokenService {
    /// Load every configured key and build the service. Fails if the active key cannot sign.
    pub fn new(config: &TokenConfig, clock: SharedClock) -> Result<Self> {
        let ring = KeyRing::from_config(config)?;
        Ok(Self::with_key_ring(config, ring, clock))
    }

    pub fn with_key_ring(config: &TokenConfig, ring: KeyRing, clock: SharedClock) -> Self {
        Self {
            keys: ArcSwap::from_pointee(ring),
            rotation: Mutex::new(()),
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            ttl: config.ttl,
            leeway: config.leeway,
            stamp_not_before: config.stamp_not_before,
            clock,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn active_key_id(&self) -> String {
        self.keys.load().signing_key().id.clone()
    }

    /// Mint a new access token for `subject`.
    pub fn sign(&self, subject: SubjectId, role: Role) -> Result<String> {
        let now = self.clock.now().timestamp();
        let ttl = i64::try_from(self.ttl.as_secs()).map_err(|_| Error::Internal {
            operation: "sign access token: ttl out of range".to_string(),
        })?;

        let claims = AccessClaims {
            sub: subject,
            role,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            iat: now,
            exp: now + ttl,
            nbf: self.stamp_not_before.then_some(now),
            jti: Uuid::new_v4(),
        };

        let ring = self.keys.load();
        let key = ring.signing_key();
        let mut header = Header::new(key.algorithm);
        header.kid = Some(key.id.clone());

        let token = encode(&header, &claims, key.encoding_key()).map_err(|e| Error::Internal {
            operation: format!("sign access token with key '{}': {e}", key.id),
        })?;

        tracing::debug!(subject = %abbrev_subject(&subject), key_id = %key.id, "Signed access token");
        Ok(token)
    }

    /// Verify a token and return who it asserts the caller is.
    pub fn verify(&self, token: &str) -> Result<Principal> {
        self.verify_claims(token).map(|claims| claims.principal())
    }

    /// Verify a token and return its full claim set.
    pub fn verify_claims(&self, token: &str) -> Result<AccessClaims> {
        let result = self.check(token);
        counter!("gatehouse_token_verify_total", "outcome" => verify_outcome(&result)).increment(1);
        result
    }

    fn check(&self, token: &str) -> Result<AccessClaims> {
        let header = decode_header(token).map_err(|e| Error::TokenMalformed {
            reason: format!("header: {e}"),
        })?;
        let key_id = header.kid.ok_or_else(|| Error::TokenMalformed {
            reason: "missing key id".to_string(),
        })?;

        let ring = self.keys.load();
        let key = ring.verification_key(&key_id).ok_or(Error::TokenInvalidSignature)?;
        if header.alg != key.algorithm {
            return Err(Error::TokenMalformed {
                reason: format!("algorithm {:?} is not allowed for key '{key_id}'", header.alg),
            });
        }

        let mut validation = Validation::new(key.algorithm);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "iat", "sub", "iss", "aud"]);
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_audience(&[self.audience.as_str()]);

        let claims = decode::<AccessClaims>(token, key.decoding_key(), &validation)
            .map_err(map_decode_error)?
            .claims;

        let now_ms = self.clock.now().timestamp_millis();
        let leeway_ms = i64::try_from(self.leeway.as_millis()).unwrap_or(i64::MAX);

        if now_ms > claims.exp.saturating_mul(1000).saturating_add(leeway_ms) {
            return Err(Error::TokenExpired);
        }
        if let Some(nbf) = claims.nbf {
            if now_ms < nbf.saturating_mul(1000).saturating_sub(leeway_ms) {
                return Err(Error::TokenNotYetValid);
            }
        }

        Ok(claims)
    }

    /// Make `key` the active signing key. Every previously trusted key stays trusted.
    pub fn rotate_signing_key(&self, key: &SigningKeyConfig) -> Result<()> {
        let loaded = LoadedKey::load(key)?;
        let _guard = self.rotation.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let next = self.keys.load().with_active(&loaded)?;
        self.keys.store(Arc::new(next));

        tracing::info!(key_id = %loaded.id, "Rotated access token signing key");
        Ok(())
    }

    /// Stop trusting `key_id`. Tokens it signed fail verification from now on.
    pub fn retire_key(&self, key_id: &str) -> Result<()> {
        let _guard = self.rotation.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let next = self.keys.load().without(key_id)?;
        self.keys.store(Arc::new(next));

        tracing::info!(key_id, "Retired access token verification key");
        Ok(())
    }
}

fn map_decode_error(e: jsonwebtoken::errors::Error) -> Error {
    match e.kind() {
        ErrorKind::InvalidSignature => Error::TokenInvalidSignature,
        ErrorKind::InvalidIssuer => Error::IssuerOrAudienceMismatch { claim: "issuer" },
        ErrorKind::InvalidAudience => Error::IssuerOrAudienceMismatch { claim: "audience" },

        // Client errors - the token itself is not well formed
        ErrorKind::InvalidToken
        | ErrorKind::MissingRequiredClaim(_)
        | ErrorKind::InvalidSubject
        | ErrorKind::InvalidAlgorithm
        | ErrorKind::Base64(_)
        | ErrorKind::Json(_)
        | ErrorKind::Utf8(_) => Error::TokenMalformed { reason: e.to_string() },

        // Server errors - key issues, internal failures
        _ => Error::Internal {
            operation: format!("verify access token: {e}"),
        },
    }
}

fn verify_outcome(result: &Result<AccessClaims>) -> &'static str {
    match result {
        Ok(_) => "valid",
        Err(Error::TokenExpired) => "expired",
        Err(Error::TokenNotYetValid) => "not_yet_valid",
        Err(Error::TokenInvalidSignature) => "invalid_signature",
        Err(Error::IssuerOrAudienceMismatch { .. }) => "claim_mismatch",
        Err(Error::TokenMalformed { .. }) => "malformed",
        Err(_) => "error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::keys::test_keys::{ED25519_PRIVATE_PEM, ED25519_PUBLIC_PEM};
    use crate::clock::{Clock, ManualClock};
    use crate::test_utils::test_config;
    use jsonwebtoken::{Algorithm, EncodingKey};

    fn service(clock: &ManualClock) -> TokenService {
        TokenService::new(&test_config().tokens, Arc::new(clock.clone())).unwrap()
    }

    #[test]
    fn test_sign_and_verify_round_trip() {
        let clock = ManualClock::starting_now();
        let tokens = service(&clock);
        let subject = Uuid::new_v4();

        for role in [Role::Admin, Role::User, Role::Viewer] {
            let token = tokens.sign(subject, role).unwrap();
            let principal = tokens.verify(&token).unwrap();
            assert_eq!(principal, Principal { subject, role });
        }
    }

    #[test]
    fn test_signed_claims() {
        let clock = ManualClock::starting_now();
        let tokens = service(&clock);
        let token = tokens.sign(Uuid::new_v4(), Role::User).unwrap();

        let header = decode_header(&token).unwrap();
        assert_eq!(header.kid.as_deref(), Some("primary"));
        assert_eq!(header.alg, Algorithm::HS256);

        let claims = tokens.verify_claims(&token).unwrap();
        assert_eq!(claims.iss, "gatehouse");
        assert_eq!(claims.aud, "gatehouse-api");
        assert_eq!(claims.iat, clock.now().timestamp());
        assert_eq!(claims.exp - claims.iat, 15 * 60);
        assert_eq!(claims.nbf, None);
    }

    #[test]
    fn test_expiry_is_enforced_after_leeway() {
        let clock = ManualClock::starting_now();
        let tokens = service(&clock);
        let token = tokens.sign(Uuid::new_v4(), Role::User).unwrap();

        // exactly at expiry + leeway the token is still accepted
        clock.advance(tokens.ttl() + Duration::from_secs(30));
        assert!(tokens.verify(&token).is_ok());

        clock.advance(Duration::from_secs(1));
        assert!(matches!(tokens.verify(&token), Err(Error::TokenExpired)));
    }

    #[test]
    fn test_not_before_is_enforced_with_leeway() {
        let clock = ManualClock::starting_now();
        let mut config = test_config();
        config.tokens.stamp_not_before = true;
        let tokens = TokenService::new(&config.tokens, Arc::new(clock.clone())).unwrap();

        let issued_at = clock.now();
        let token = tokens.sign(Uuid::new_v4(), Role::Viewer).unwrap();

        // a verifier whose clock runs behind by less than the leeway accepts the token
        clock.set(issued_at - chrono::Duration::seconds(30));
        assert!(tokens.verify(&token).is_ok());

        clock.set(issued_at - chrono::Duration::seconds(31));
        assert!(matches!(tokens.verify(&token), Err(Error::TokenNotYetValid)));
    }

    #[test]
    fn test_wrong_secret_is_invalid_signature() {
        let clock = ManualClock::starting_now();
        let tokens = service(&clock);
        let token = tokens.sign(Uuid::new_v4(), Role::User).unwrap();

        let mut other = test_config();
        other.tokens.keys = vec![SigningKeyConfig::hmac("primary", "a-completely-different-secret")];
        let other = TokenService::new(&other.tokens, Arc::new(clock.clone())).unwrap();

        assert!(matches!(other.verify(&token), Err(Error::TokenInvalidSignature)));
    }

    #[test]
    fn test_unknown_key_id_is_invalid_signature() {
        let clock = ManualClock::starting_now();
        let tokens = service(&clock);

        let mut other = test_config();
        other.tokens.keys = vec![SigningKeyConfig::hmac("elsewhere", "test-secret-key-for-jwt-signing")];
        let other = TokenService::new(&other.tokens, Arc::new(clock.clone())).unwrap();
        let token = other.sign(Uuid::new_v4(), Role::User).unwrap();

        assert!(matches!(tokens.verify(&token), Err(Error::TokenInvalidSignature)));
    }

    #[test]
    fn test_issuer_and_audience_must_match_exactly() {
        let clock = ManualClock::starting_now();
        let tokens = service(&clock);
        let token = tokens.sign(Uuid::new_v4(), Role::User).unwrap();

        let mut config = test_config();
        config.tokens.issuer = "gatehouse-staging".to_string();
        let other_issuer = TokenService::new(&config.tokens, Arc::new(clock.clone())).unwrap();
        assert!(matches!(
            other_issuer.verify(&token),
            Err(Error::IssuerOrAudienceMismatch { claim: "issuer" })
        ));

        let mut config = test_config();
        config.tokens.audience = "billing-api".to_string();
        let other_audience = TokenService::new(&config.tokens, Arc::new(clock.clone())).unwrap();
        assert!(matches!(
            other_audience.verify(&token),
            Err(Error::IssuerOrAudienceMismatch { claim: "audience" })
        ));
    }

    #[test]
    fn test_malformed_tokens() {
        let clock = ManualClock::starting_now();
        let tokens = service(&clock);

        assert!(matches!(tokens.verify("not-a-token"), Err(Error::TokenMalformed { .. })));
        assert!(matches!(tokens.verify("invalid.token.here"), Err(Error::TokenMalformed { .. })));
        assert!(matches!(tokens.verify(""), Err(Error::TokenMalformed { .. })));
    }

    #[test]
    fn test_token_without_key_id_is_malformed() {
        let clock = ManualClock::starting_now();
        let tokens = service(&clock);
        let now = clock.now().timestamp();
        let claims = AccessClaims {
            sub: Uuid::new_v4(),
            role: Role::Admin,
            iss: "gatehouse".to_string(),
            aud: "gatehouse-api".to_string(),
            iat: now,
            exp: now + 60,
            nbf: None,
            jti: Uuid::new_v4(),
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"test-secret-key-for-jwt-signing"),
        )
        .unwrap();

        assert!(matches!(tokens.verify(&token), Err(Error::TokenMalformed { .. })));
    }

    #[test]
    fn test_algorithm_must_match_the_key() {
        let clock = ManualClock::starting_now();
        let tokens = service(&clock);
        let now = clock.now().timestamp();
        let claims = AccessClaims {
            sub: Uuid::new_v4(),
            role: Role::Admin,
            iss: "gatehouse".to_string(),
            aud: "gatehouse-api".to_string(),
            iat: now,
            exp: now + 60,
            nbf: None,
            jti: Uuid::new_v4(),
        };
        let mut header = Header::new(Algorithm::HS512);
        header.kid = Some("primary".to_string());
        let token = encode(&header, &claims, &EncodingKey::from_secret(b"test-secret-key-for-jwt-signing")).unwrap();

        assert!(matches!(tokens.verify(&token), Err(Error::TokenMalformed { .. })));
    }

    #[test]
    fn test_rotation_keeps_old_tokens_verifiable_until_retired() {
        let clock = ManualClock::starting_now();
        let tokens = service(&clock);
        let subject = Uuid::new_v4();

        let before = tokens.sign(subject, Role::User).unwrap();

        tokens
            .rotate_signing_key(&SigningKeyConfig::hmac("next", "the-next-secret-in-the-rotation"))
            .unwrap();
        assert_eq!(tokens.active_key_id(), "next");

        let after = tokens.sign(subject, Role::User).unwrap();
        assert_eq!(decode_header(&after).unwrap().kid.as_deref(), Some("next"));

        assert_eq!(tokens.verify(&before).unwrap().subject, subject);
        assert_eq!(tokens.verify(&after).unwrap().subject, subject);

        tokens.retire_key("primary").unwrap();
        assert!(matches!(tokens.verify(&before), Err(Error::TokenInvalidSignature)));
        assert!(tokens.verify(&after).is_ok());

        assert!(tokens.retire_key("next").is_err());
    }

    #[test]
    fn test_ed25519_signing() {
        let clock = ManualClock::starting_now();
        let mut config = test_config();
        config.tokens.keys.push(SigningKeyConfig {
            id: "ed-1".to_string(),
            algorithm: Algorithm::EdDSA,
            secret: None,
            private_key_path: None,
            private_key_pem: Some(ED25519_PRIVATE_PEM.to_string()),
            public_key_path: None,
            public_key_pem: Some(ED25519_PUBLIC_PEM.to_string()),
        });
        config.tokens.active_key_id = Some("ed-1".to_string());
        let tokens = TokenService::new(&config.tokens, Arc::new(clock.clone())).unwrap();

        let subject = Uuid::new_v4();
        let token = tokens.sign(subject, Role::Admin).unwrap();
        assert_eq!(decode_header(&token).unwrap().alg, Algorithm::EdDSA);
        assert_eq!(
            tokens.verify(&token).unwrap(),
            Principal {
                subject,
                role: Role::Admin
            }
        );

        // a verify-only instance holding just the public half accepts it too
        let mut verifier = test_config();
        verifier.tokens.keys.push(SigningKeyConfig {
            id: "ed-1".to_string(),
            algorithm: Algorithm::EdDSA,
            secret: None,
            private_key_path: None,
            private_key_pem: None,
            public_key_path: None,
            public_key_pem: Some(ED25519_PUBLIC_PEM.to_string()),
        });
        let verifier = TokenService::new(&verifier.tokens, Arc::new(clock.clone())).unwrap();
        assert_eq!(verifier.verify(&token).unwrap().subject, subject);
    }
}
