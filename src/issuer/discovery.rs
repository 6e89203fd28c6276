//! OpenID discovery issuer: keys fetched from the issuer's published
//! configuration.
//!
//! # Key resolution
//!
//! 1. Render the configuration URL, filling `{claim}` placeholders from the
//!    current token (a missing claim denies). Claim values are
//!    percent-encoded.
//! 2. GET the configuration document. Its `issuer` must equal the resolved
//!    issuer name; then read `jwks_uri`.
//! 3. GET the key set and select the key whose `kid` equals the token's.
//! 4. With an `x5c` chain, the leaf certificate's SubjectPublicKeyInfo is the
//!    key; otherwise the JWK parameters are converted directly.
//!
//! Fetches are not cached unless a TTL is configured; expired entries are
//! swept whenever a new document is stored. Every fetch has a timeout and,
//! by default, only HTTPS URLs are fetched.

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use dashmap::DashMap;
use jsonwebtoken::DecodingKey;
use jsonwebtoken::jwk::{AlgorithmParameters, Jwk, JwkSet};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use x509_parser::prelude::FromDer;
use x509_parser::certificate::X509Certificate;
use x509_parser::public_key::PublicKey;

use super::{IssuerDenial, IssuerPolicy, KeyFamily, VerificationKey};
use crate::credential::Credential;
use crate::template::Template;
use crate::{Error, Result};

/// Default per-fetch timeout
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

const ED25519_OID: &str = "1.3.101.112";

/// The parts of an OpenID configuration document used here
#[derive(Debug, Clone, Deserialize)]
pub struct OpenIdConfiguration {
    /// Issuer identifier
    #[serde(default)]
    pub issuer: Option<String>,
    /// Key set location
    pub jwks_uri: String,
}

/// Cached document
struct CachedDocument {
    value: Value,
    fetched_at: Instant,
}

/// HTTP client for configuration documents and key sets, with an optional
/// per-URL cache.
pub struct KeySetFetcher {
    http: reqwest::Client,
    cache: DashMap<String, CachedDocument>,
    /// Zero disables caching
    cache_ttl: Duration,
}

impl std::fmt::Debug for KeySetFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySetFetcher")
            .field("cache_ttl", &self.cache_ttl)
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl KeySetFetcher {
    /// Create a fetcher.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the HTTP client cannot be built.
    pub fn new(timeout: Duration, cache_ttl: Duration, https_only: bool) -> Result<Self> {
        let http = reqwest::Client::builder()
            .https_only(https_only)
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build discovery HTTP client: {e}")))?;
        Ok(Self {
            http,
            cache: DashMap::new(),
            cache_ttl,
        })
    }

    /// Number of cached documents
    #[must_use]
    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }

    /// Fetch the configuration document at `url`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] on network, status or format failure.
    pub async fn configuration(&self, url: &str) -> Result<OpenIdConfiguration> {
        let value = self.get_json(url).await?;
        serde_json::from_value(value)
            .map_err(|e| Error::Transport(format!("Invalid discovery document at {url}: {e}")))
    }

    /// Fetch the key set at `url`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] on network, status or format failure.
    pub async fn key_set(&self, url: &str) -> Result<JwkSet> {
        let value = self.get_json(url).await?;
        serde_json::from_value(value)
            .map_err(|e| Error::Transport(format!("Invalid key set at {url}: {e}")))
    }

    async fn get_json(&self, url: &str) -> Result<Value> {
        if !self.cache_ttl.is_zero() {
            if let Some(cached) = self.cache.get(url) {
                if cached.fetched_at.elapsed() < self.cache_ttl {
                    return Ok(cached.value.clone());
                }
            }
        }

        debug!(origin = "issuer", url = %url, "Fetching discovery document");
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("GET {url} failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Transport(format!(
                "GET {url} returned HTTP {}",
                response.status()
            )));
        }
        let value: Value = response
            .json()
            .await
            .map_err(|e| Error::Transport(format!("GET {url} returned invalid JSON: {e}")))?;

        if !self.cache_ttl.is_zero() {
            self.evict_expired();
            self.cache.insert(
                url.to_string(),
                CachedDocument {
                    value: value.clone(),
                    fetched_at: Instant::now(),
                },
            );
        }
        Ok(value)
    }

    fn evict_expired(&self) {
        let ttl = self.cache_ttl;
        self.cache.retain(|_, cached| cached.fetched_at.elapsed() < ttl);
    }
}

/// Discovery issuer
#[derive(Debug)]
pub struct DiscoveryIssuer {
    policy: IssuerPolicy,
    config_url: Template,
    fetcher: Arc<KeySetFetcher>,
}

impl DiscoveryIssuer {
    /// Create a discovery issuer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `config_url` has an empty placeholder.
    pub fn new(
        policy: IssuerPolicy,
        config_url: impl Into<String>,
        fetcher: Arc<KeySetFetcher>,
    ) -> Result<Self> {
        Ok(Self {
            policy,
            config_url: Template::parse(config_url)?,
            fetcher,
        })
    }

    /// Shared settings
    #[must_use]
    pub fn policy(&self) -> &IssuerPolicy {
        &self.policy
    }

    /// Unrendered configuration URL
    #[must_use]
    pub fn config_url(&self) -> &str {
        self.config_url.as_str()
    }

    /// Resolve the verification key for `credential`, published by the
    /// issuer named `issuer`.
    pub(crate) async fn resolve_key(
        &self,
        credential: &Credential,
        issuer: &str,
    ) -> std::result::Result<VerificationKey, IssuerDenial> {
        let url = self
            .config_url
            .render_url(&credential.payload)
            .map_err(IssuerDenial::MissingClaim)?;
        let kid = credential
            .kid()
            .ok_or_else(|| IssuerDenial::KeyResolution("token header has no 'kid'".to_string()))?;

        let configuration = self
            .fetcher
            .configuration(&url)
            .await
            .map_err(|e| IssuerDenial::KeyResolution(e.to_string()))?;
        if configuration.issuer.as_deref() != Some(issuer) {
            return Err(IssuerDenial::KeyResolution(format!(
                "discovery document at {url} names issuer {:?}, expected '{issuer}'",
                configuration.issuer.as_deref().unwrap_or_default()
            )));
        }
        let jwks = self
            .fetcher
            .key_set(&configuration.jwks_uri)
            .await
            .map_err(|e| IssuerDenial::KeyResolution(e.to_string()))?;

        let jwk = jwks
            .find(kid)
            .ok_or_else(|| IssuerDenial::KeyResolution(format!("no key with kid '{kid}'")))?;
        key_from_jwk(jwk).map_err(IssuerDenial::KeyResolution)
    }
}

/// Convert a JWK to a verification key, preferring its `x5c` leaf.
fn key_from_jwk(jwk: &Jwk) -> std::result::Result<VerificationKey, String> {
    if let Some(leaf) = jwk.common.x509_chain.as_ref().and_then(|chain| chain.first()) {
        return key_from_certificate(leaf);
    }

    let invalid = |e: jsonwebtoken::errors::Error| format!("invalid JWK: {e}");
    match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e)
            .map(|k| VerificationKey::new(k, KeyFamily::Rsa))
            .map_err(invalid),
        AlgorithmParameters::EllipticCurve(ec) => DecodingKey::from_ec_components(&ec.x, &ec.y)
            .map(|k| VerificationKey::new(k, KeyFamily::Ec))
            .map_err(invalid),
        AlgorithmParameters::OctetKey(oct) => URL_SAFE_NO_PAD
            .decode(oct.value.trim_end_matches('='))
            .map(|secret| VerificationKey::new(DecodingKey::from_secret(&secret), KeyFamily::Hmac))
            .map_err(|e| format!("invalid JWK secret: {e}")),
        AlgorithmParameters::OctetKeyPair(okp) => DecodingKey::from_ed_components(&okp.x)
            .map(|k| VerificationKey::new(k, KeyFamily::Ed))
            .map_err(invalid),
    }
}

/// Derive a key from a base64 (standard alphabet) DER certificate.
fn key_from_certificate(b64_der: &str) -> std::result::Result<VerificationKey, String> {
    let der = STANDARD
        .decode(b64_der)
        .map_err(|e| format!("x5c entry is not base64: {e}"))?;
    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|e| format!("x5c entry is not a certificate: {e}"))?;

    let spki = cert.public_key();
    let pem = spki_to_pem(spki.raw);
    let invalid = |e: jsonwebtoken::errors::Error| format!("unusable certificate key: {e}");

    match spki.parsed() {
        Ok(PublicKey::RSA(_)) => DecodingKey::from_rsa_pem(pem.as_bytes())
            .map(|k| VerificationKey::new(k, KeyFamily::Rsa))
            .map_err(invalid),
        Ok(PublicKey::EC(_)) => DecodingKey::from_ec_pem(pem.as_bytes())
            .map(|k| VerificationKey::new(k, KeyFamily::Ec))
            .map_err(invalid),
        _ if spki.algorithm.algorithm.to_id_string() == ED25519_OID => {
            DecodingKey::from_ed_pem(pem.as_bytes())
                .map(|k| VerificationKey::new(k, KeyFamily::Ed))
                .map_err(invalid)
        }
        _ => Err(format!(
            "unsupported certificate key algorithm {}",
            spki.algorithm.algorithm.to_id_string()
        )),
    }
}

/// Wrap DER SubjectPublicKeyInfo bytes as a `PUBLIC KEY` PEM block.
fn spki_to_pem(der: &[u8]) -> String {
    let encoded = STANDARD.encode(der);
    let mut pem = String::from("-----BEGIN PUBLIC KEY-----\n");
    for line in encoded.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str("-----END PUBLIC KEY-----\n");
    pem
}
