//! Authentication utility functions.

use base64::{Engine as _, engine::general_purpose};
use rand::prelude::RngExt;
use rand::rng;
use sha2::{Digest, Sha256};

/// Bytes of randomness in a refresh token (256 bits)
pub const REFRESH_TOKEN_BYTES: usize = 32;
/// Bytes of randomness in the OIDC `state` parameter
pub const STATE_BYTES: usize = 24;
/// Bytes of randomness in the OIDC `nonce`
pub const NONCE_BYTES: usize = 24;
/// 48 bytes encode to a 64 character verifier, inside the 43..=128 range PKCE allows
pub const CODE_VERIFIER_BYTES: usize = 48;

/// Generate `len` bytes of cryptographically secure random data, base64url encoded without padding.
pub fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rng().fill(bytes.as_mut_slice());

    general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// PKCE `S256` challenge: base64url(sha256(verifier)).
pub fn pkce_challenge(verifier: &str) -> String {
    general_purpose::URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Digest under which a bearer secret is stored, so a leaked table holds nothing replayable.
pub fn hash_token(token: &str) -> String {
    general_purpose::URL_SAFE_NO_PAD.encode(Sha256::digest(token.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_token() {
        let token1 = random_token(REFRESH_TOKEN_BYTES);
        let token2 = random_token(REFRESH_TOKEN_BYTES);

        assert_ne!(token1, token2);
        // 32 bytes base64url encoded is 43 chars
        assert_eq!(token1.len(), 43);
        assert!(token1.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));

        assert_eq!(random_token(CODE_VERIFIER_BYTES).len(), 64);
    }

    #[test]
    fn test_pkce_challenge_rfc7636_vector() {
        // RFC 7636 Appendix B
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(pkce_challenge(verifier), "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");
    }

    #[test]
    fn test_hash_token_is_stable_and_distinct() {
        assert_eq!(hash_token("abc"), hash_token("abc"));
        assert_ne!(hash_token("abc"), hash_token("abd"));
        assert_ne!(hash_token("abc"), "abc");
    }
}
