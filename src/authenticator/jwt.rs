//! Bearer token mechanism

use std::collections::BTreeSet;

use futures::future::join_all;
use tracing::debug;

use super::{Assertion, DenialReason, MechanismOutcome};
use crate::channel::ValueChannel;
use crate::context::HttpContext;
use crate::credential::{Claims, Credential};
use crate::issuer::{Issuer, IssuerDenial, IssuerVerdict};

/// Default credential header
pub const DEFAULT_TOKEN_HEADER: &str = "authorization";
/// Default scheme prefix
pub const DEFAULT_SCHEME: &str = "Bearer";

/// Reads a token, decodes it and asks every issuer to verify it
#[derive(Debug)]
pub struct JwtAuthenticator {
    name: String,
    channel: ValueChannel,
    field: String,
    scheme: Option<String>,
    issuers: Vec<Issuer>,
}

impl JwtAuthenticator {
    /// Mechanism reading `Authorization: Bearer <token>`
    pub fn new(name: impl Into<String>, issuers: Vec<Issuer>) -> Self {
        Self {
            name: name.into(),
            channel: ValueChannel::Header,
            field: DEFAULT_TOKEN_HEADER.to_string(),
            scheme: Some(DEFAULT_SCHEME.to_string()),
            issuers,
        }
    }

    /// Read the token from `field` on `channel`
    #[must_use]
    pub fn from_channel(mut self, channel: ValueChannel, field: impl Into<String>) -> Self {
        self.channel = channel;
        self.field = field.into();
        self
    }

    /// Scheme prefix to strip (`None` reads the raw value)
    #[must_use]
    pub fn scheme(mut self, scheme: Option<String>) -> Self {
        self.scheme = scheme.filter(|s| !s.is_empty());
        self
    }

    /// Mechanism name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured issuers
    #[must_use]
    pub fn issuers(&self) -> &[Issuer] {
        &self.issuers
    }

    /// Token from the configured location, scheme stripped.
    ///
    /// With a scheme configured, a value carrying another scheme is no token.
    #[must_use]
    pub fn extract_token(&self, ctx: &HttpContext) -> Option<String> {
        let value = self.channel.read(ctx, &self.field)?;
        let value = value.trim();
        let token = match &self.scheme {
            Some(scheme) => {
                let (prefix, rest) = value.split_once(char::is_whitespace)?;
                if !prefix.eq_ignore_ascii_case(scheme) {
                    return None;
                }
                rest.trim()
            }
            None => value,
        };
        (!token.is_empty()).then(|| token.to_string())
    }

    /// Evaluate this mechanism and record the outcome.
    pub async fn authenticate(&self, ctx: &HttpContext, assertion: &mut Assertion) {
        match self.evaluate(ctx).await {
            Ok((roles, claims)) => {
                debug!(origin = "jwt", mechanism = %self.name, sub = ?claims.sub, "Token accepted");
                assertion.set_claims(claims);
                assertion.record(&self.name, MechanismOutcome::verified(roles));
            }
            Err(reason) => {
                debug!(origin = "jwt", mechanism = %self.name, reason = %reason, "Token not accepted");
                assertion.record(&self.name, MechanismOutcome::denied(reason));
            }
        }
    }

    async fn evaluate(
        &self,
        ctx: &HttpContext,
    ) -> Result<(BTreeSet<String>, Claims), DenialReason> {
        let token = self.extract_token(ctx).ok_or(DenialReason::NoTokenFound)?;
        let credential = Credential::decode(&token).map_err(|e| {
            debug!(origin = "jwt", mechanism = %self.name, error = %e, "Token decode failed");
            DenialReason::MalformedToken
        })?;

        let now = chrono::Utc::now().timestamp();
        if credential.is_expired_at(now) {
            return Err(DenialReason::TokenExpired);
        }
        if credential.is_not_yet_valid_at(now) {
            return Err(DenialReason::TokenNotYetValid);
        }

        let verdicts = join_all(self.issuers.iter().map(|i| i.verify(ctx, &credential))).await;
        merge_verdicts(verdicts).map(|roles| (roles, credential.claims))
    }
}

/// OR of verdicts, union of roles. When nothing verified, the first
/// denial other than an issuer mismatch explains why.
fn merge_verdicts(verdicts: Vec<IssuerVerdict>) -> Result<BTreeSet<String>, DenialReason> {
    let mut verified = false;
    let mut roles = BTreeSet::new();
    let mut reason = None;

    for verdict in verdicts {
        match verdict {
            IssuerVerdict::Verified { roles: granted } => {
                verified = true;
                roles.extend(granted);
            }
            IssuerVerdict::Denied(denial) => {
                if reason.is_none() {
                    reason = denial_reason(&denial);
                }
            }
        }
    }

    if verified {
        Ok(roles)
    } else {
        Err(reason.unwrap_or(DenialReason::UntrustedIssuer))
    }
}

fn denial_reason(denial: &IssuerDenial) -> Option<DenialReason> {
    match denial {
        IssuerDenial::IssuerMismatch { .. } => None,
        IssuerDenial::MissingClaim(_) => Some(DenialReason::MissingClaim),
        IssuerDenial::KeyResolution(_) => Some(DenialReason::KeyUnavailable),
        IssuerDenial::InvalidSignature(_) => Some(DenialReason::InvalidSignature),
        IssuerDenial::AudienceMismatch => Some(DenialReason::AudienceMismatch),
        IssuerDenial::NonceMismatch => Some(DenialReason::NonceMismatch),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::HttpRequest;
    use crate::cookie::CookieOptions;
    use crate::issuer::{IssuerPolicy, KeyMaterial, StaticKeyIssuer};
    use axum::http::Method;
    use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
    use serde_json::{Value, json};

    fn issuer(name: &str, secret: &str, roles: &[&str]) -> Issuer {
        StaticKeyIssuer::new(
            IssuerPolicy::new(name).unwrap().roles(roles.iter().copied()),
            &KeyMaterial::Secret(secret.to_string()),
        )
        .unwrap()
        .into()
    }

    fn sign(claims: &Value, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn bearer(token: &str) -> HttpContext {
        HttpContext::new(
            HttpRequest::new(Method::GET, "/")
                .with_header("authorization", &format!("bearer {token}"))
                .unwrap(),
        )
    }

    #[test]
    fn scheme_is_case_insensitive_and_required() {
        let auth = JwtAuthenticator::new("jwt", vec![]);
        assert_eq!(auth.extract_token(&bearer("abc")).as_deref(), Some("abc"));

        let basic = HttpContext::new(
            HttpRequest::new(Method::GET, "/")
                .with_header("authorization", "Basic abc")
                .unwrap(),
        );
        assert_eq!(auth.extract_token(&basic), None);
    }

    #[test]
    fn raw_channel_without_scheme() {
        let auth = JwtAuthenticator::new("jwt", vec![])
            .from_channel(ValueChannel::Cookie(CookieOptions::default()), "id_token")
            .scheme(None);
        let ctx = HttpContext::new(
            HttpRequest::new(Method::GET, "/")
                .with_header("cookie", "id_token=abc")
                .unwrap(),
        );
        assert_eq!(auth.extract_token(&ctx).as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn union_of_roles_across_issuers() {
        // GIVEN: two issuers with the same name and secret, granting different roles
        let auth = JwtAuthenticator::new(
            "jwt",
            vec![
                issuer("https://iss", "k", &["a"]),
                issuer("https://iss", "k", &["b"]),
                issuer("https://other", "k", &["c"]),
            ],
        );
        let ctx = bearer(&sign(&json!({ "iss": "https://iss" }), "k"));
        let mut assertion = Assertion::default();

        // WHEN: authenticating
        auth.authenticate(&ctx, &mut assertion).await;

        // THEN: roles are the union of the verifying issuers only
        let expected: BTreeSet<String> = ["a".to_string(), "b".to_string()].into();
        assert_eq!(assertion.roles(), expected);
        assert!(assertion.claims().is_some());
    }

    #[tokio::test]
    async fn expired_by_one_second() {
        let auth = JwtAuthenticator::new("jwt", vec![issuer("https://iss", "k", &[])]);
        let exp = chrono::Utc::now().timestamp() - 1;
        let ctx = bearer(&sign(&json!({ "iss": "https://iss", "exp": exp }), "k"));
        let mut assertion = Assertion::default();
        auth.authenticate(&ctx, &mut assertion).await;
        assert_eq!(assertion.denial(), Some(DenialReason::TokenExpired));
    }

    #[tokio::test]
    async fn untrusted_when_every_issuer_mismatches() {
        let auth = JwtAuthenticator::new("jwt", vec![issuer("https://a", "k", &[])]);
        let ctx = bearer(&sign(&json!({ "iss": "https://b" }), "k"));
        let mut assertion = Assertion::default();
        auth.authenticate(&ctx, &mut assertion).await;
        assert_eq!(assertion.denial(), Some(DenialReason::UntrustedIssuer));
    }

    #[tokio::test]
    async fn signature_failure_beats_mismatch() {
        let auth = JwtAuthenticator::new(
            "jwt",
            vec![issuer("https://a", "k", &[]), issuer("https://b", "k", &[])],
        );
        let ctx = bearer(&sign(&json!({ "iss": "https://b" }), "wrong"));
        let mut assertion = Assertion::default();
        auth.authenticate(&ctx, &mut assertion).await;
        assert_eq!(assertion.denial(), Some(DenialReason::InvalidSignature));
    }

    #[tokio::test]
    async fn missing_and_malformed_tokens() {
        let auth = JwtAuthenticator::new("jwt", vec![]);
        let mut assertion = Assertion::default();
        auth.authenticate(&HttpContext::new(HttpRequest::new(Method::GET, "/")), &mut assertion)
            .await;
        assert_eq!(assertion.denial(), Some(DenialReason::NoTokenFound));

        let mut assertion = Assertion::default();
        auth.authenticate(&bearer("not-a-jwt"), &mut assertion).await;
        assert_eq!(assertion.denial(), Some(DenialReason::MalformedToken));
    }

    #[test]
    fn merge_prefers_first_meaningful_denial() {
        let verdicts = vec![
            IssuerVerdict::Denied(IssuerDenial::IssuerMismatch {
                expected: "a".to_string(),
                actual: "b".to_string(),
            }),
            IssuerVerdict::Denied(IssuerDenial::KeyResolution("down".to_string())),
            IssuerVerdict::Denied(IssuerDenial::AudienceMismatch),
        ];
        assert_eq!(merge_verdicts(verdicts), Err(DenialReason::KeyUnavailable));
    }
}
