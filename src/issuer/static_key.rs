//! Issuer whose verification key is fixed in configuration

use jsonwebtoken::DecodingKey;
use serde::Deserialize;

use super::{IssuerPolicy, KeyFamily, VerificationKey};
use crate::{Error, Result};

/// Key material accepted by a static-key issuer
#[derive(Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyMaterial {
    /// Shared HMAC secret
    Secret(String),
    /// RSA public key (PEM, PKCS#1 or SubjectPublicKeyInfo)
    RsaPem(String),
    /// EC public key (PEM)
    EcPem(String),
    /// Ed25519 public key (PEM)
    EdPem(String),
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Secret(_) => f.write_str("Secret(***)"),
            Self::RsaPem(_) => f.write_str("RsaPem(..)"),
            Self::EcPem(_) => f.write_str("EcPem(..)"),
            Self::EdPem(_) => f.write_str("EdPem(..)"),
        }
    }
}

impl KeyMaterial {
    /// Build the verification key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an empty secret or an unparseable PEM.
    pub fn to_key(&self) -> Result<VerificationKey> {
        let pem_error = |kind: &str, e: jsonwebtoken::errors::Error| {
            Error::Config(format!("Invalid {kind} public key: {e}"))
        };
        match self {
            Self::Secret(secret) => {
                if secret.is_empty() {
                    return Err(Error::Config("Issuer secret must not be empty".to_string()));
                }
                Ok(VerificationKey::new(
                    DecodingKey::from_secret(secret.as_bytes()),
                    KeyFamily::Hmac,
                ))
            }
            Self::RsaPem(pem) => DecodingKey::from_rsa_pem(pem.as_bytes())
                .map(|k| VerificationKey::new(k, KeyFamily::Rsa))
                .map_err(|e| pem_error("RSA", e)),
            Self::EcPem(pem) => DecodingKey::from_ec_pem(pem.as_bytes())
                .map(|k| VerificationKey::new(k, KeyFamily::Ec))
                .map_err(|e| pem_error("EC", e)),
            Self::EdPem(pem) => DecodingKey::from_ed_pem(pem.as_bytes())
                .map(|k| VerificationKey::new(k, KeyFamily::Ed))
                .map_err(|e| pem_error("Ed25519", e)),
        }
    }
}

/// Static-key issuer
#[derive(Debug)]
pub struct StaticKeyIssuer {
    policy: IssuerPolicy,
    key: VerificationKey,
}

impl StaticKeyIssuer {
    /// Build from key material.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the key material is invalid.
    pub fn new(policy: IssuerPolicy, material: &KeyMaterial) -> Result<Self> {
        Ok(Self {
            policy,
            key: material.to_key()?,
        })
    }

    /// Build from an already constructed key
    #[must_use]
    pub fn with_key(policy: IssuerPolicy, key: VerificationKey) -> Self {
        Self { policy, key }
    }

    /// Shared settings
    #[must_use]
    pub fn policy(&self) -> &IssuerPolicy {
        &self.policy
    }

    pub(crate) fn key(&self) -> &VerificationKey {
        &self.key
    }
}
