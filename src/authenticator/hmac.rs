//! Shared-secret signature of the raw request body

use std::collections::BTreeSet;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use hmac::{Hmac, KeyInit, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Sha256, Sha384, Sha512};
use subtle::ConstantTimeEq;
use tracing::debug;

use super::{Assertion, DenialReason, MechanismOutcome};
use crate::channel::ValueChannel;
use crate::context::HttpContext;
use crate::{Error, Result};

/// HMAC digest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    /// HMAC-SHA256
    #[default]
    Sha256,
    /// HMAC-SHA384
    Sha384,
    /// HMAC-SHA512
    Sha512,
}

impl DigestAlgorithm {
    fn mac(self, secret: &[u8], body: &[u8]) -> Result<Vec<u8>> {
        Ok(match self {
            Self::Sha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(secret)
                    .map_err(|e| Error::Crypto(format!("Invalid HMAC secret: {e}")))?;
                mac.update(body);
                mac.finalize().into_bytes().to_vec()
            }
            Self::Sha384 => {
                let mut mac = Hmac::<Sha384>::new_from_slice(secret)
                    .map_err(|e| Error::Crypto(format!("Invalid HMAC secret: {e}")))?;
                mac.update(body);
                mac.finalize().into_bytes().to_vec()
            }
            Self::Sha512 => {
                let mut mac = Hmac::<Sha512>::new_from_slice(secret)
                    .map_err(|e| Error::Crypto(format!("Invalid HMAC secret: {e}")))?;
                mac.update(body);
                mac.finalize().into_bytes().to_vec()
            }
        })
    }
}

/// Text form of the signature
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextEncoding {
    /// Hexadecimal, compared case-insensitively
    #[default]
    Hex,
    /// Base64 (standard or URL-safe alphabet)
    Base64,
}

impl TextEncoding {
    /// Encode digest bytes
    #[must_use]
    pub fn encode(self, bytes: &[u8]) -> String {
        match self {
            Self::Hex => hex::encode(bytes),
            Self::Base64 => STANDARD.encode(bytes),
        }
    }

    fn decode(self, text: &str) -> Option<Vec<u8>> {
        match self {
            Self::Hex => hex::decode(text).ok(),
            Self::Base64 => STANDARD
                .decode(text)
                .ok()
                .or_else(|| URL_SAFE_NO_PAD.decode(text.trim_end_matches('=')).ok()),
        }
    }
}

/// Verifies a body signature carried in a header (or any channel)
pub struct HmacAuthenticator {
    name: String,
    secret: String,
    channel: ValueChannel,
    field: String,
    algorithm: DigestAlgorithm,
    encoding: TextEncoding,
    prefix: Option<String>,
    roles: BTreeSet<String>,
}

impl std::fmt::Debug for HmacAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacAuthenticator")
            .field("name", &self.name)
            .field("channel", &self.channel)
            .field("field", &self.field)
            .field("algorithm", &self.algorithm)
            .field("encoding", &self.encoding)
            .field("prefix", &self.prefix)
            .field("roles", &self.roles)
            .finish_non_exhaustive()
    }
}

impl HmacAuthenticator {
    /// HMAC-SHA256, hex, read from header `field`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the secret is empty.
    pub fn new(
        name: impl Into<String>,
        secret: impl Into<String>,
        field: impl Into<String>,
    ) -> Result<Self> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(Error::Config("HMAC secret must not be empty".to_string()));
        }
        Ok(Self {
            name: name.into(),
            secret,
            channel: ValueChannel::Header,
            field: field.into(),
            algorithm: DigestAlgorithm::default(),
            encoding: TextEncoding::default(),
            prefix: None,
            roles: BTreeSet::new(),
        })
    }

    /// Read the signature from `channel` instead of a header
    #[must_use]
    pub fn channel(mut self, channel: ValueChannel) -> Self {
        self.channel = channel;
        self
    }

    /// Digest algorithm
    #[must_use]
    pub fn algorithm(mut self, algorithm: DigestAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Signature text encoding
    #[must_use]
    pub fn encoding(mut self, encoding: TextEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Prefix stripped from the signature when present (e.g. `sha256=`)
    #[must_use]
    pub fn prefix(mut self, prefix: Option<String>) -> Self {
        self.prefix = prefix.filter(|p| !p.is_empty());
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

    /// Mechanism name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signature of `body` in the configured encoding, without prefix
    ///
    /// # Errors
    ///
    /// Returns [`Error::Crypto`] if the MAC cannot be keyed.
    pub fn sign(&self, body: &[u8]) -> Result<String> {
        let digest = self.algorithm.mac(self.secret.as_bytes(), body)?;
        Ok(self.encoding.encode(&digest))
    }

    /// Evaluate this mechanism and record the outcome.
    pub async fn authenticate(&self, ctx: &HttpContext, assertion: &mut Assertion) {
        let outcome = match self.evaluate(ctx) {
            Ok(()) => {
                debug!(origin = "hmac", mechanism = %self.name, "Signature accepted");
                MechanismOutcome::verified(self.roles.clone())
            }
            Err(reason) => {
                debug!(origin = "hmac", mechanism = %self.name, reason = %reason, "Signature not accepted");
                MechanismOutcome::denied(reason)
            }
        };
        assertion.record(&self.name, outcome);
    }

    fn evaluate(&self, ctx: &HttpContext) -> std::result::Result<(), DenialReason> {
        let provided = self
            .channel
            .read(ctx, &self.field)
            .ok_or(DenialReason::NoSignatureFound)?;
        let provided = provided.trim();
        let provided = self
            .prefix
            .as_deref()
            .and_then(|p| provided.strip_prefix(p))
            .unwrap_or(provided);
        if provided.is_empty() {
            return Err(DenialReason::NoSignatureFound);
        }

        let expected = self
            .algorithm
            .mac(self.secret.as_bytes(), &ctx.request.raw_body)
            .map_err(|e| {
                debug!(origin = "hmac", mechanism = %self.name, error = %e, "Digest failed");
                DenialReason::SignatureMismatch
            })?;
        let provided = self
            .encoding
            .decode(provided)
            .ok_or(DenialReason::SignatureMismatch)?;

        if bool::from(expected.as_slice().ct_eq(provided.as_slice())) {
            Ok(())
        } else {
            Err(DenialReason::SignatureMismatch)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::HttpRequest;
    use axum::http::Method;

    fn ctx(signature: Option<&str>, body: &str) -> HttpContext {
        let mut request = HttpRequest::new(Method::POST, "/hook").with_body(body.to_string());
        if let Some(sig) = signature {
            request = request.with_header("x-signature", sig).unwrap();
        }
        HttpContext::new(request)
    }

    #[test]
    fn known_sha256_vector() {
        // RFC 4231 test case 2
        let auth = HmacAuthenticator::new("hmac", "Jefe", "x-signature").unwrap();
        assert_eq!(
            auth.sign(b"what do ya want for nothing?").unwrap(),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[tokio::test]
    async fn hex_signature_is_case_insensitive() {
        let auth = HmacAuthenticator::new("hmac", "secret", "x-signature")
            .unwrap()
            .prefix(Some("sha256=".to_string()))
            .roles(["webhook"]);
        let body = r#"{"event":"push"}"#;
        let sig = auth.sign(body.as_bytes()).unwrap().to_uppercase();

        let mut assertion = Assertion::default();
        auth.authenticate(&ctx(Some(&format!("sha256={sig}")), body), &mut assertion)
            .await;
        assert!(assertion.is_authenticated());
        assert!(assertion.roles().contains("webhook"));
    }

    #[tokio::test]
    async fn missing_and_wrong_signatures() {
        let auth = HmacAuthenticator::new("hmac", "secret", "x-signature").unwrap();

        let mut assertion = Assertion::default();
        auth.authenticate(&ctx(None, "body"), &mut assertion).await;
        assert_eq!(assertion.denial(), Some(DenialReason::NoSignatureFound));

        let mut assertion = Assertion::default();
        auth.authenticate(&ctx(Some("deadbeef"), "body"), &mut assertion).await;
        assert_eq!(assertion.denial(), Some(DenialReason::SignatureMismatch));

        let mut assertion = Assertion::default();
        auth.authenticate(&ctx(Some("not hex"), "body"), &mut assertion).await;
        assert_eq!(assertion.denial(), Some(DenialReason::SignatureMismatch));
    }

    #[tokio::test]
    async fn base64_sha512() {
        let auth = HmacAuthenticator::new("hmac", "secret", "x-signature")
            .unwrap()
            .algorithm(DigestAlgorithm::Sha512)
            .encoding(TextEncoding::Base64);
        let sig = auth.sign(b"payload").unwrap();
        assert_eq!(STANDARD.decode(&sig).unwrap().len(), 64);

        let mut assertion = Assertion::default();
        auth.authenticate(&ctx(Some(&sig), "payload"), &mut assertion).await;
        assert!(assertion.is_authenticated());
    }

    #[test]
    fn empty_secret_rejected() {
        assert!(matches!(
            HmacAuthenticator::new("hmac", "", "x"),
            Err(Error::Config(_))
        ));
    }
}
