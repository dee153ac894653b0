//! Authentication: access tokens, refresh tokens, federated login state and the login flows that
//! tie them together.
//!
//! - [`tokens`]: sign and verify access tokens under a rotating [`keys::KeyRing`]
//! - [`refresh`]: opaque refresh tokens with single-use rotation
//! - [`oidc`]: authorization-code + PKCE handshake state and the identity provider seam
//! - [`login`]: the [`login::Authenticator`] orchestrating password, federated, refresh and logout
//! - [`password`]: Argon2id hashing
//! - [`utils`]: random tokens, PKCE challenges, token digests

pub mod keys;
pub mod login;
pub mod oidc;
pub mod password;
pub mod refresh;
pub mod tokens;
pub mod utils;
