//! Trust issuers: decide whether a decoded token belongs to a trusted
//! authority, and which roles it earns.
//!
//! # Verification flow
//!
//! 1. Resolve the issuer name (discovery names may carry `{claim}`
//!    placeholders) and compare it with the token's `iss`.
//! 2. Obtain the verification key: configured (static) or fetched
//!    (discovery document, then JWKS, selected by `kid`).
//! 3. Verify the signature under an algorithm from the key's family only.
//! 4. Check the audience allow-list (empty allows any).
//! 5. Check the nonce when enabled and the nonce source supplies one.
//! 6. Grant the issuer's roles.
//!
//! Every failure is local: it is logged and becomes an
//! [`IssuerVerdict::Denied`]. Nothing here returns an error or panics.

pub mod discovery;
pub mod nonce;
pub mod static_key;

use std::collections::BTreeSet;
use std::sync::Arc;

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde_json::Value;
use tracing::{debug, warn};

use crate::audit::{self, AuditEvent};
use crate::context::HttpContext;
use crate::credential::Credential;
use crate::template::Template;

pub use discovery::{DiscoveryIssuer, KeySetFetcher};
pub use nonce::{NoNonce, NonceSource, SessionNonce};
pub use static_key::{KeyMaterial, StaticKeyIssuer};

/// Outcome of one issuer's verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssuerVerdict {
    /// Token verified; these roles are granted
    Verified {
        /// Roles configured on the issuer
        roles: BTreeSet<String>,
    },
    /// Token rejected
    Denied(IssuerDenial),
}

impl IssuerVerdict {
    /// Whether the token verified
    #[must_use]
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified { .. })
    }
}

/// Why an issuer rejected a token
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IssuerDenial {
    /// The token names a different issuer
    #[error("issuer mismatch: expected {expected}, got {actual}")]
    IssuerMismatch {
        /// Resolved issuer name
        expected: String,
        /// Token `iss`
        actual: String,
    },

    /// A `{claim}` placeholder in the configuration URL has no value
    #[error("missing claim '{0}'")]
    MissingClaim(String),

    /// The verification key could not be obtained
    #[error("key resolution failed: {0}")]
    KeyResolution(String),

    /// Signature or algorithm check failed
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// No token audience is in the allow-list
    #[error("audience mismatch")]
    AudienceMismatch,

    /// Token nonce differs from the expected one
    #[error("nonce mismatch")]
    NonceMismatch,
}

/// Algorithm family a key can verify
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFamily {
    /// Shared secret (HS*)
    Hmac,
    /// RSA (RS*, PS*)
    Rsa,
    /// NIST curves (ES*)
    Ec,
    /// Edwards curves (EdDSA)
    Ed,
}

impl KeyFamily {
    /// Algorithms permitted for keys of this family
    #[must_use]
    pub fn algorithms(self) -> &'static [Algorithm] {
        match self {
            Self::Hmac => &[Algorithm::HS256, Algorithm::HS384, Algorithm::HS512],
            Self::Rsa => &[
                Algorithm::RS256,
                Algorithm::RS384,
                Algorithm::RS512,
                Algorithm::PS256,
                Algorithm::PS384,
                Algorithm::PS512,
            ],
            Self::Ec => &[Algorithm::ES256, Algorithm::ES384],
            Self::Ed => &[Algorithm::EdDSA],
        }
    }
}

/// A decoding key bound to its algorithm family
#[derive(Clone)]
pub struct VerificationKey {
    key: DecodingKey,
    family: KeyFamily,
}

impl std::fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationKey")
            .field("family", &self.family)
            .finish_non_exhaustive()
    }
}

impl VerificationKey {
    /// Bind a key to its family
    #[must_use]
    pub fn new(key: DecodingKey, family: KeyFamily) -> Self {
        Self { key, family }
    }

    /// Key family
    #[must_use]
    pub fn family(&self) -> KeyFamily {
        self.family
    }

    /// Verify the token signature. Claims are not validated here.
    fn verify(&self, credential: &Credential) -> Result<(), IssuerDenial> {
        let alg = credential.header.alg;
        if !self.family.algorithms().contains(&alg) {
            return Err(IssuerDenial::InvalidSignature(format!(
                "algorithm {alg:?} not permitted for a {:?} key",
                self.family
            )));
        }

        let mut validation = Validation::new(alg);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        jsonwebtoken::decode::<Value>(credential.raw.as_str(), &self.key, &validation)
            .map(|_| ())
            .map_err(|e| IssuerDenial::InvalidSignature(e.to_string()))
    }
}

/// Issuer settings shared by every issuer variant
#[derive(Clone)]
pub struct IssuerPolicy {
    name: Template,
    audiences: Vec<String>,
    roles: BTreeSet<String>,
    validate_nonce: bool,
    nonce: Arc<dyn NonceSource>,
}

impl std::fmt::Debug for IssuerPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuerPolicy")
            .field("name", &self.name.as_str())
            .field("audiences", &self.audiences)
            .field("roles", &self.roles)
            .field("validate_nonce", &self.validate_nonce)
            .finish_non_exhaustive()
    }
}

impl IssuerPolicy {
    /// Policy for the issuer named `name`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] if `name` has an empty placeholder.
    pub fn new(name: impl Into<String>) -> crate::Result<Self> {
        Ok(Self {
            name: Template::parse(name)?,
            audiences: Vec::new(),
            roles: BTreeSet::new(),
            validate_nonce: false,
            nonce: Arc::new(NoNonce),
        })
    }

    /// Audience allow-list
    #[must_use]
    pub fn audiences<I, S>(mut self, audiences: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.audiences = audiences.into_iter().map(Into::into).collect();
        self
    }

    /// Roles granted on success
    #[must_use]
    pub fn roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    /// Enable nonce validation against `source`
    #[must_use]
    pub fn nonce(mut self, source: Arc<dyn NonceSource>) -> Self {
        self.validate_nonce = true;
        self.nonce = source;
        self
    }

    /// Unresolved issuer name
    #[must_use]
    pub fn name(&self) -> &str {
        self.name.as_str()
    }
}

/// A trust issuer
#[derive(Debug)]
pub enum Issuer {
    /// Key fixed in configuration
    StaticKey(StaticKeyIssuer),
    /// Keys discovered through an OpenID configuration document
    Discovery(DiscoveryIssuer),
}

impl From<StaticKeyIssuer> for Issuer {
    fn from(issuer: StaticKeyIssuer) -> Self {
        Self::StaticKey(issuer)
    }
}

impl From<DiscoveryIssuer> for Issuer {
    fn from(issuer: DiscoveryIssuer) -> Self {
        Self::Discovery(issuer)
    }
}

impl Issuer {
    /// Shared settings
    #[must_use]
    pub fn policy(&self) -> &IssuerPolicy {
        match self {
            Self::StaticKey(i) => i.policy(),
            Self::Discovery(i) => i.policy(),
        }
    }

    /// Unresolved issuer name
    #[must_use]
    pub fn name(&self) -> &str {
        self.policy().name()
    }

    /// Verify `credential` against this issuer.
    pub async fn verify(&self, ctx: &HttpContext, credential: &Credential) -> IssuerVerdict {
        match self.try_verify(ctx, credential).await {
            Ok(roles) => {
                debug!(origin = "issuer", issuer = %self.name(), "Token verified");
                IssuerVerdict::Verified { roles }
            }
            Err(denial) => {
                match &denial {
                    IssuerDenial::IssuerMismatch { .. } => {
                        debug!(origin = "issuer", issuer = %self.name(), reason = %denial, "Issuer not applicable");
                    }
                    IssuerDenial::InvalidSignature(reason) => {
                        warn!(origin = "issuer", issuer = %self.name(), reason = %denial, "Token signature rejected");
                        audit::emit(&AuditEvent::signature_invalid(
                            self.name(),
                            credential.claims.sub.as_deref(),
                            reason.clone(),
                        ));
                    }
                    _ => {
                        warn!(origin = "issuer", issuer = %self.name(), reason = %denial, "Token rejected");
                    }
                }
                IssuerVerdict::Denied(denial)
            }
        }
    }

    async fn try_verify(
        &self,
        ctx: &HttpContext,
        credential: &Credential,
    ) -> Result<BTreeSet<String>, IssuerDenial> {
        let policy = self.policy();
        let actual = credential.issuer().unwrap_or_default();

        // A name placeholder the token cannot fill means the token is not ours
        let expected = policy
            .name
            .render(&credential.payload)
            .map_err(|_| IssuerDenial::IssuerMismatch {
                expected: policy.name().to_string(),
                actual: actual.to_string(),
            })?;
        if actual != expected {
            return Err(IssuerDenial::IssuerMismatch {
                expected,
                actual: actual.to_string(),
            });
        }

        let fetched;
        let key = match self {
            Self::StaticKey(i) => i.key(),
            Self::Discovery(i) => {
                fetched = i.resolve_key(credential, &expected).await?;
                &fetched
            }
        };
        key.verify(credential)?;

        if !policy.audiences.is_empty() && !credential.claims.audience_matches(&policy.audiences) {
            return Err(IssuerDenial::AudienceMismatch);
        }

        if policy.validate_nonce {
            if let Some(expected) = policy.nonce.expected_nonce(ctx, credential).await {
                if credential.claims.nonce.as_deref() != Some(expected.as_str()) {
                    return Err(IssuerDenial::NonceMismatch);
                }
            }
        }

        Ok(policy.roles.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::HttpRequest;
    use axum::http::Method;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::json;

    fn ctx() -> HttpContext {
        HttpContext::new(HttpRequest::new(Method::GET, "/"))
    }

    fn hs256(claims: &Value, secret: &[u8]) -> Credential {
        let raw = encode(&Header::new(Algorithm::HS256), claims, &EncodingKey::from_secret(secret)).unwrap();
        Credential::decode(&raw).unwrap()
    }

    fn issuer(policy: IssuerPolicy) -> Issuer {
        StaticKeyIssuer::new(policy, &KeyMaterial::Secret("s3cret".to_string()))
            .unwrap()
            .into()
    }

    #[tokio::test]
    async fn valid_token_earns_roles() {
        // GIVEN: a static HMAC issuer granting "reader"
        let issuer = issuer(IssuerPolicy::new("https://iss").unwrap().roles(["reader"]));
        // WHEN: verifying a token it signed
        let cred = hs256(&json!({ "iss": "https://iss" }), b"s3cret");
        let verdict = issuer.verify(&ctx(), &cred).await;
        // THEN: verified with its roles
        assert_eq!(
            verdict,
            IssuerVerdict::Verified {
                roles: ["reader".to_string()].into()
            }
        );
    }

    #[tokio::test]
    async fn other_issuer_is_mismatch() {
        let issuer = issuer(IssuerPolicy::new("https://iss").unwrap());
        let cred = hs256(&json!({ "iss": "https://elsewhere" }), b"s3cret");
        assert!(matches!(
            issuer.verify(&ctx(), &cred).await,
            IssuerVerdict::Denied(IssuerDenial::IssuerMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn wrong_secret_is_invalid_signature() {
        let issuer = issuer(IssuerPolicy::new("https://iss").unwrap());
        let cred = hs256(&json!({ "iss": "https://iss" }), b"other");
        assert!(matches!(
            issuer.verify(&ctx(), &cred).await,
            IssuerVerdict::Denied(IssuerDenial::InvalidSignature(_))
        ));
    }

    #[tokio::test]
    async fn expired_token_still_verifies_signature() {
        // Expiry belongs to the authenticator, not the issuer
        let issuer = issuer(IssuerPolicy::new("https://iss").unwrap());
        let cred = hs256(&json!({ "iss": "https://iss", "exp": 1 }), b"s3cret");
        assert!(issuer.verify(&ctx(), &cred).await.is_verified());
    }

    #[tokio::test]
    async fn audience_allow_list_enforced() {
        let issuer = issuer(IssuerPolicy::new("https://iss").unwrap().audiences(["api"]));
        let good = hs256(&json!({ "iss": "https://iss", "aud": ["web", "api"] }), b"s3cret");
        let bad = hs256(&json!({ "iss": "https://iss", "aud": "web" }), b"s3cret");
        assert!(issuer.verify(&ctx(), &good).await.is_verified());
        assert_eq!(
            issuer.verify(&ctx(), &bad).await,
            IssuerVerdict::Denied(IssuerDenial::AudienceMismatch)
        );
    }

    #[test]
    fn algorithm_outside_key_family_rejected() {
        let key = VerificationKey::new(DecodingKey::from_secret(b"s3cret"), KeyFamily::Rsa);
        let cred = hs256(&json!({ "iss": "https://iss" }), b"s3cret");
        assert!(matches!(key.verify(&cred), Err(IssuerDenial::InvalidSignature(_))));
    }

    #[tokio::test]
    async fn templated_name_without_claim_is_mismatch() {
        let issuer = issuer(IssuerPolicy::new("https://login/{tid}/v2.0").unwrap());
        let cred = hs256(&json!({ "iss": "https://login/t1/v2.0" }), b"s3cret");
        assert!(matches!(
            issuer.verify(&ctx(), &cred).await,
            IssuerVerdict::Denied(IssuerDenial::IssuerMismatch { .. })
        ));

        let cred = hs256(&json!({ "iss": "https://login/t1/v2.0", "tid": "t1" }), b"s3cret");
        assert!(issuer.verify(&ctx(), &cred).await.is_verified());
    }

    fn ctx_with_nonce(nonce: &str) -> HttpContext {
        let mut ctx = ctx();
        let mut session = crate::session::Session::new();
        session.set("oidc_nonce", nonce);
        ctx.session = Some(session);
        ctx
    }

    #[tokio::test]
    async fn session_nonce_must_match_token() {
        // GIVEN: an issuer validating nonces held in the session
        let issuer = issuer(
            IssuerPolicy::new("https://iss")
                .unwrap()
                .nonce(Arc::new(SessionNonce::new("oidc_nonce"))),
        );
        let ctx = ctx_with_nonce("n-1");

        // WHEN / THEN: a different nonce is denied, the same one verifies
        let replayed = hs256(&json!({ "iss": "https://iss", "nonce": "n-2" }), b"s3cret");
        assert_eq!(
            issuer.verify(&ctx, &replayed).await,
            IssuerVerdict::Denied(IssuerDenial::NonceMismatch)
        );
        let missing = hs256(&json!({ "iss": "https://iss" }), b"s3cret");
        assert_eq!(
            issuer.verify(&ctx, &missing).await,
            IssuerVerdict::Denied(IssuerDenial::NonceMismatch)
        );
        let fresh = hs256(&json!({ "iss": "https://iss", "nonce": "n-1" }), b"s3cret");
        assert!(issuer.verify(&ctx, &fresh).await.is_verified());
    }

    #[tokio::test]
    async fn nonce_check_skipped_without_expected_value() {
        let issuer = issuer(
            IssuerPolicy::new("https://iss")
                .unwrap()
                .nonce(Arc::new(SessionNonce::new("oidc_nonce"))),
        );
        let cred = hs256(&json!({ "iss": "https://iss", "nonce": "anything" }), b"s3cret");
        assert!(issuer.verify(&ctx(), &cred).await.is_verified());
    }

    #[tokio::test]
    async fn nonce_ignored_unless_enabled() {
        let issuer = issuer(IssuerPolicy::new("https://iss").unwrap());
        let cred = hs256(&json!({ "iss": "https://iss", "nonce": "n-2" }), b"s3cret");
        assert!(issuer.verify(&ctx_with_nonce("n-1"), &cred).await.is_verified());
    }
}
