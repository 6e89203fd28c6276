//! Authenticator chain
//!
//! A chain is an ordered list of links, each an [`Authenticator`] plus a
//! `required` flag. Every link is evaluated; outcomes land in one
//! [`Assertion`]. The request is authenticated when at least one link
//! verified and no required link failed.

mod assertion;
pub mod hmac;
pub mod jwt;

use std::collections::HashSet;

use tracing::debug;

pub use self::assertion::{Assertion, DenialReason, MechanismOutcome};
pub use self::hmac::{DigestAlgorithm, HmacAuthenticator, TextEncoding};
pub use self::jwt::JwtAuthenticator;

use crate::context::HttpContext;
use crate::{Error, Result};

/// An authentication mechanism
#[derive(Debug)]
pub enum Authenticator {
    /// Bearer token verified by trust issuers
    Jwt(JwtAuthenticator),
    /// Shared-secret body signature
    Hmac(HmacAuthenticator),
}

impl From<JwtAuthenticator> for Authenticator {
    fn from(auth: JwtAuthenticator) -> Self {
        Self::Jwt(auth)
    }
}

impl From<HmacAuthenticator> for Authenticator {
    fn from(auth: HmacAuthenticator) -> Self {
        Self::Hmac(auth)
    }
}

impl Authenticator {
    /// Mechanism name (unique within a chain)
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Jwt(a) => a.name(),
            Self::Hmac(a) => a.name(),
        }
    }

    /// Evaluate and record the outcome on `assertion`
    pub async fn authenticate(&self, ctx: &HttpContext, assertion: &mut Assertion) {
        match self {
            Self::Jwt(a) => a.authenticate(ctx, assertion).await,
            Self::Hmac(a) => a.authenticate(ctx, assertion).await,
        }
    }
}

/// One chain entry
#[derive(Debug)]
pub struct ChainLink {
    /// The mechanism
    pub authenticator: Authenticator,
    /// Whether failure of this link denies the request outright
    pub required: bool,
}

/// Ordered, immutable list of mechanisms
#[derive(Debug, Default)]
pub struct AuthenticatorChain {
    links: Vec<ChainLink>,
}

impl AuthenticatorChain {
    /// Start building a chain
    #[must_use]
    pub fn builder() -> ChainBuilder {
        ChainBuilder::default()
    }

    /// Links in evaluation order
    #[must_use]
    pub fn links(&self) -> &[ChainLink] {
        &self.links
    }

    /// Whether the chain has no links
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Evaluate every link in order.
    pub async fn evaluate(&self, ctx: &HttpContext) -> Assertion {
        let mut assertion = Assertion::default();
        for link in &self.links {
            link.authenticator.authenticate(ctx, &mut assertion).await;
            assertion.set_required(link.authenticator.name(), link.required);
        }
        debug!(
            origin = "lifecycle",
            authenticated = assertion.is_authenticated(),
            mechanisms = self.links.len(),
            "Authenticator chain evaluated"
        );
        assertion
    }
}

/// Builder for [`AuthenticatorChain`]
#[derive(Debug, Default)]
pub struct ChainBuilder {
    links: Vec<ChainLink>,
}

impl ChainBuilder {
    /// Append an optional link
    #[must_use]
    pub fn link(mut self, authenticator: impl Into<Authenticator>) -> Self {
        self.links.push(ChainLink {
            authenticator: authenticator.into(),
            required: false,
        });
        self
    }

    /// Append a required link
    #[must_use]
    pub fn required(mut self, authenticator: impl Into<Authenticator>) -> Self {
        self.links.push(ChainLink {
            authenticator: authenticator.into(),
            required: true,
        });
        self
    }

    /// Finish the chain.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if two links share a name.
    pub fn build(self) -> Result<AuthenticatorChain> {
        let mut seen = HashSet::new();
        for link in &self.links {
            let name = link.authenticator.name();
            if !seen.insert(name) {
                return Err(Error::Config(format!("Duplicate authenticator name '{name}'")));
            }
        }
        Ok(AuthenticatorChain { links: self.links })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::HttpRequest;
    use crate::issuer::{IssuerPolicy, KeyMaterial, StaticKeyIssuer};
    use axum::http::Method;
    use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
    use serde_json::json;
    use std::collections::BTreeSet;

    fn jwt() -> JwtAuthenticator {
        let issuer = StaticKeyIssuer::new(
            IssuerPolicy::new("https://iss").unwrap().roles(["user"]),
            &KeyMaterial::Secret("k".to_string()),
        )
        .unwrap();
        JwtAuthenticator::new("jwt", vec![issuer.into()])
    }

    fn hmac() -> HmacAuthenticator {
        HmacAuthenticator::new("hmac", "s", "x-signature")
            .unwrap()
            .roles(["service"])
    }

    fn request(token: bool, signature: bool) -> HttpContext {
        let body = "{}";
        let mut request = HttpRequest::new(Method::POST, "/").with_body(body);
        if token {
            let token = encode(
                &Header::new(Algorithm::HS256),
                &json!({ "iss": "https://iss" }),
                &EncodingKey::from_secret(b"k"),
            )
            .unwrap();
            request = request
                .with_header("authorization", &format!("Bearer {token}"))
                .unwrap();
        }
        if signature {
            let sig = hmac().sign(body.as_bytes()).unwrap();
            request = request.with_header("x-signature", &sig).unwrap();
        }
        HttpContext::new(request)
    }

    #[tokio::test]
    async fn optional_links_or_together() {
        let chain = AuthenticatorChain::builder().link(jwt()).link(hmac()).build().unwrap();

        let assertion = chain.evaluate(&request(true, false)).await;
        assert!(assertion.is_authenticated());
        assert_eq!(assertion.roles(), BTreeSet::from(["user".to_string()]));

        let assertion = chain.evaluate(&request(true, true)).await;
        assert_eq!(
            assertion.roles(),
            BTreeSet::from(["service".to_string(), "user".to_string()])
        );
    }

    #[tokio::test]
    async fn required_link_failure_denies() {
        let chain = AuthenticatorChain::builder()
            .link(jwt())
            .required(hmac())
            .build()
            .unwrap();

        let assertion = chain.evaluate(&request(true, false)).await;
        assert!(!assertion.is_authenticated());
        assert_eq!(assertion.denial(), Some(DenialReason::NoSignatureFound));

        let assertion = chain.evaluate(&request(false, true)).await;
        assert!(assertion.is_authenticated());
        assert_eq!(assertion.roles(), BTreeSet::from(["service".to_string()]));
    }

    #[test]
    fn duplicate_names_rejected() {
        let result = AuthenticatorChain::builder().link(jwt()).link(jwt()).build();
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
