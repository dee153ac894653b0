//! Signing and verification keys for access tokens.
//!
//! A [`KeyRing`] holds exactly one signing key and any number of verification keys, all indexed by
//! key id. Tokens carry the id of the key that signed them in their `kid` header, so a token signed
//! before a rotation keeps verifying for as long as its key stays in the ring.
//!
//! Key material is read once, at startup. A ring whose active key cannot sign is a startup error;
//! nothing here reads files at request time.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::config::{SigningKeyConfig, TokenConfig};
use crate::errors::{Error, Result};

/// Material able to sign new tokens.
#[derive(Clone)]
pub struct SigningKey {
    pub id: String,
    pub algorithm: Algorithm,
    key: EncodingKey,
}

impl SigningKey {
    pub fn encoding_key(&self) -> &EncodingKey {
        &self.key
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("id", &self.id)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// Material able to check a signature.
#[derive(Clone)]
pub struct VerificationKey {
    pub algorithm: Algorithm,
    key: DecodingKey,
}

impl VerificationKey {
    pub fn decoding_key(&self) -> &DecodingKey {
        &self.key
    }
}

impl fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationKey")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// A key parsed from configuration, before it is placed in a ring.
#[derive(Debug, Clone)]
pub struct LoadedKey {
    pub id: String,
    pub signing: Option<SigningKey>,
    pub verification: VerificationKey,
}

impl LoadedKey {
    pub fn load(config: &SigningKeyConfig) -> Result<Self> {
        let id = config.id.clone();
        let algorithm = config.algorithm;

        if config.is_symmetric() {
            let secret = config.secret.as_deref().filter(|s| !s.is_empty()).ok_or_else(|| Error::Internal {
                operation: format!("load HMAC key '{id}': secret is missing"),
            })?;

            return Ok(Self {
                signing: Some(SigningKey {
                    id: id.clone(),
                    algorithm,
                    key: EncodingKey::from_secret(secret.as_bytes()),
                }),
                verification: VerificationKey {
                    algorithm,
                    key: DecodingKey::from_secret(secret.as_bytes()),
                },
                id,
            });
        }

        let public_pem = read_material(&id, "public", config.public_key_path.as_deref(), config.public_key_pem.as_deref())?
            .ok_or_else(|| Error::Internal {
                operation: format!("load key '{id}': public key is missing"),
            })?;
        let private_pem = read_material(&id, "private", config.private_key_path.as_deref(), config.private_key_pem.as_deref())?;

        let family = KeyFamily::of(algorithm);
        let map_err = |what: &str, e: jsonwebtoken::errors::Error| Error::Internal {
            operation: format!("parse {what} key '{id}' for {algorithm:?}: {e}"),
        };

        let verification = match family {
            KeyFamily::Rsa => DecodingKey::from_rsa_pem(&public_pem),
            KeyFamily::Ec => DecodingKey::from_ec_pem(&public_pem),
            KeyFamily::Ed => DecodingKey::from_ed_pem(&public_pem),
        }
        .map_err(|e| map_err("public", e))?;

        let signing = match private_pem {
            Some(pem) => {
                let key = match family {
                    KeyFamily::Rsa => EncodingKey::from_rsa_pem(&pem),
                    KeyFamily::Ec => EncodingKey::from_ec_pem(&pem),
                    KeyFamily::Ed => EncodingKey::from_ed_pem(&pem),
                }
                .map_err(|e| map_err("private", e))?;
                Some(SigningKey {
                    id: id.clone(),
                    algorithm,
                    key,
                })
            }
            None => None,
        };

        Ok(Self {
            id,
            signing,
            verification: VerificationKey {
                algorithm,
                key: verification,
            },
        })
    }
}

/// PEM flavour expected for an asymmetric algorithm.
enum KeyFamily {
    Rsa,
    Ec,
    Ed,
}

impl KeyFamily {
    fn of(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::ES256 | Algorithm::ES384 => KeyFamily::Ec,
            Algorithm::EdDSA => KeyFamily::Ed,
            _ => KeyFamily::Rsa,
        }
    }
}

fn read_material(id: &str, kind: &str, path: Option<&Path>, inline: Option<&str>) -> Result<Option<Vec<u8>>> {
    if let Some(pem) = inline {
        return Ok(Some(pem.as_bytes().to_vec()));
    }
    match path {
        Some(path) => std::fs::read(path).map(Some).map_err(|e| Error::Internal {
            operation: format!("read {kind} key '{id}' from {}: {e}", path.display()),
        }),
        None => Ok(None),
    }
}

/// The active signing key plus every key currently trusted for verification.
#[derive(Debug, Clone)]
pub struct KeyRing {
    signing: Arc<SigningKey>,
    verification: HashMap<String, Arc<VerificationKey>>,
}

impl KeyRing {
    /// Build the ring described by configuration.
    ///
    /// Fails if any key cannot be parsed or if the active key has no private material.
    pub fn from_config(config: &TokenConfig) -> Result<Self> {
        let active_id = config.active_key_id().ok_or_else(|| Error::Internal {
            operation: "build key ring: no signing keys configured".to_string(),
        })?;

        let mut verification = HashMap::new();
        let mut signing = None;

        for key_config in &config.keys {
            let loaded = LoadedKey::load(key_config)?;
            if loaded.id == active_id {
                signing = loaded.signing.clone();
                if signing.is_none() {
                    return Err(Error::Internal {
                        operation: format!("build key ring: active key '{active_id}' has no private key"),
                    });
                }
            }
            verification.insert(loaded.id, Arc::new(loaded.verification));
        }

        let signing = signing.ok_or_else(|| Error::Internal {
            operation: format!("build key ring: active key '{active_id}' is not configured"),
        })?;

        tracing::info!(
            active_key_id = %signing.id,
            verification_keys = verification.len(),
            "Loaded access token keys"
        );

        Ok(Self {
            signing: Arc::new(signing),
            verification,
        })
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing
    }

    pub fn verification_key(&self, key_id: &str) -> Option<&VerificationKey> {
        self.verification.get(key_id).map(Arc::as_ref)
    }

    pub fn key_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.verification.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// A copy of this ring that signs with `key` and still verifies everything it verified before.
    pub fn with_active(&self, key: &LoadedKey) -> Result<Self> {
        let signing = key.signing.clone().ok_or_else(|| Error::Internal {
            operation: format!("rotate signing key: key '{}' has no private key", key.id),
        })?;

        let mut verification = self.verification.clone();
        verification.insert(key.id.clone(), Arc::new(key.verification.clone()));

        Ok(Self {
            signing: Arc::new(signing),
            verification,
        })
    }

    /// A copy of this ring that no longer trusts `key_id`. The active key cannot be retired.
    pub fn without(&self, key_id: &str) -> Result<Self> {
        if self.signing.id == key_id {
            return Err(Error::BadRequest {
                message: format!("key '{key_id}' is the active signing key and cannot be retired"),
            });
        }

        let mut verification = self.verification.clone();
        verification.remove(key_id);

        Ok(Self {
            signing: self.signing.clone(),
            verification,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::test_keys::*;
    use super::*;
    use crate::test_utils::test_config;
    use std::io::Write;

    fn ed25519_key(id: &str, with_private: bool) -> SigningKeyConfig {
        SigningKeyConfig {
            id: id.to_string(),
            algorithm: Algorithm::EdDSA,
            secret: None,
            private_key_path: None,
            private_key_pem: with_private.then(|| ED25519_PRIVATE_PEM.to_string()),
            public_key_path: None,
            public_key_pem: Some(ED25519_PUBLIC_PEM.to_string()),
        }
    }

    #[test]
    fn test_ring_from_hmac_config() {
        let config = test_config();
        let ring = KeyRing::from_config(&config.tokens).unwrap();

        assert_eq!(ring.signing_key().id, "primary");
        assert_eq!(ring.signing_key().algorithm, Algorithm::HS256);
        assert!(ring.verification_key("primary").is_some());
        assert!(ring.verification_key("other").is_none());
    }

    #[test]
    fn test_ring_loads_ed25519_from_files() {
        let mut private = tempfile::NamedTempFile::new().unwrap();
        private.write_all(ED25519_PRIVATE_PEM.as_bytes()).unwrap();
        let mut public = tempfile::NamedTempFile::new().unwrap();
        public.write_all(ED25519_PUBLIC_PEM.as_bytes()).unwrap();

        let mut config = test_config();
        config.tokens.keys.push(SigningKeyConfig {
            id: "ed-1".to_string(),
            algorithm: Algorithm::EdDSA,
            secret: None,
            private_key_path: Some(private.path().to_path_buf()),
            private_key_pem: None,
            public_key_path: Some(public.path().to_path_buf()),
            public_key_pem: None,
        });
        config.tokens.active_key_id = Some("ed-1".to_string());

        let ring = KeyRing::from_config(&config.tokens).unwrap();
        assert_eq!(ring.signing_key().algorithm, Algorithm::EdDSA);
        assert_eq!(ring.key_ids(), vec!["ed-1".to_string(), "primary".to_string()]);
    }

    #[test]
    fn test_active_key_without_private_material_is_fatal() {
        let mut config = test_config();
        config.tokens.keys.push(ed25519_key("ed-verify-only", false));
        config.tokens.active_key_id = Some("ed-verify-only".to_string());

        let err = KeyRing::from_config(&config.tokens).unwrap_err();
        assert!(err.to_string().contains("has no private key"));
    }

    #[test]
    fn test_missing_key_file_is_fatal() {
        let mut config = test_config();
        let mut key = ed25519_key("ed-1", false);
        key.public_key_pem = None;
        key.public_key_path = Some("/nonexistent/gatehouse/public.pem".into());
        config.tokens.keys.push(key);

        assert!(KeyRing::from_config(&config.tokens).is_err());
    }

    #[test]
    fn test_with_active_keeps_previous_verification_keys() {
        let ring = KeyRing::from_config(&test_config().tokens).unwrap();
        let next = LoadedKey::load(&SigningKeyConfig::hmac("next", "another-secret-of-decent-length")).unwrap();

        let rotated = ring.with_active(&next).unwrap();
        assert_eq!(rotated.signing_key().id, "next");
        assert!(rotated.verification_key("primary").is_some());
        assert!(rotated.verification_key("next").is_some());

        // the original ring is untouched
        assert_eq!(ring.signing_key().id, "primary");
    }

    #[test]
    fn test_cannot_retire_active_key() {
        let ring = KeyRing::from_config(&test_config().tokens).unwrap();
        assert!(ring.without("primary").is_err());
    }
}
