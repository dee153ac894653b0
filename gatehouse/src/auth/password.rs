//! Password hashing and verification.
//!
//! Callers see only the [`PasswordHasher`] capability; [`Argon2Hasher`] is the implementation the
//! binary wires in.

use argon2::{
    Algorithm, Argon2, Params, Version,
    password_hash::{self, PasswordHash, PasswordVerifier, SaltString, rand_core::OsRng},
};
use std::fmt::Debug;

use crate::errors::Error;

/// Opaque `Hash`/`Compare` capability over password digests.
pub trait PasswordHasher: Debug + Send + Sync {
    fn hash(&self, plaintext: &str) -> Result<String, Error>;

    /// Whether `plaintext` matches `digest`. A digest that cannot be parsed is an error, not a mismatch.
    fn compare(&self, digest: &str, plaintext: &str) -> Result<bool, Error>;
}

/// Argon2 hashing parameters.
#[derive(Debug, Clone, Copy)]
pub struct Argon2Params {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Argon2Params {
    /// Create Argon2 instance with these parameters.
    fn to_argon2(self) -> Result<Argon2<'static>, Error> {
        let params = Params::new(self.memory_kib, self.iterations, self.parallelism, None).map_err(|e| Error::Internal {
            operation: format!("create argon2 params: {e}"),
        })?;

        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

impl Default for Argon2Params {
    /// Secure defaults for production (Argon2id RFC recommendations)
    fn default() -> Self {
        Self {
            memory_kib: 19456, // 19 MB
            iterations: 2,
            parallelism: 1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Argon2Hasher {
    params: Argon2Params,
}

impl Argon2Hasher {
    pub fn new(params: Argon2Params) -> Self {
        Self { params }
    }
}

impl PasswordHasher for Argon2Hasher {
    fn hash(&self, plaintext: &str) -> Result<String, Error> {
        use argon2::password_hash::PasswordHasher as _;

        let salt = SaltString::generate(&mut OsRng);
        let argon2 = self.params.to_argon2()?;

        let hash = argon2.hash_password(plaintext.as_bytes(), &salt).map_err(|e| Error::Internal {
            operation: format!("hash password: {e}"),
        })?;

        Ok(hash.to_string())
    }

    fn compare(&self, digest: &str, plaintext: &str) -> Result<bool, Error> {
        let parsed_hash = PasswordHash::new(digest).map_err(|e| Error::Internal {
            operation: format!("parse password hash: {e}"),
        })?;

        // Verification always uses params from the hash
        match Argon2::default().verify_password(plaintext.as_bytes(), &parsed_hash) {
            Ok(()) => Ok(true),
            Err(password_hash::Error::Password) => Ok(false),
            Err(e) => Err(Error::Internal {
                operation: format!("verify password: {e}"),
            }),
        }
    }
}
