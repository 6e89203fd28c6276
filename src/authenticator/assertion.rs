//! Per-request record of every mechanism's verdict

use std::collections::BTreeSet;
use std::fmt;

use serde::{Serialize, Serializer};

use crate::credential::Claims;

/// Why a mechanism did not verify
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DenialReason {
    /// The chain has no mechanisms
    NoCredentials,
    /// No bearer token in the configured location
    NoTokenFound,
    /// The token could not be decoded
    MalformedToken,
    /// `now >= exp`
    TokenExpired,
    /// `now < nbf`
    TokenNotYetValid,
    /// Signature or algorithm check failed
    InvalidSignature,
    /// Audience not in the allow-list
    AudienceMismatch,
    /// Nonce differs from the expected one
    NonceMismatch,
    /// Verification key could not be obtained
    KeyUnavailable,
    /// A templated claim is missing from the token
    MissingClaim,
    /// No configured issuer matches the token
    UntrustedIssuer,
    /// No HMAC signature in the configured location
    NoSignatureFound,
    /// HMAC signature differs from the computed digest
    SignatureMismatch,
}

impl DenialReason {
    /// Human-readable reason, used as the 401 message
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoCredentials => "No Credentials",
            Self::NoTokenFound => "No Token Found",
            Self::MalformedToken => "Malformed Token",
            Self::TokenExpired => "Token Expired",
            Self::TokenNotYetValid => "Token Not Yet Valid",
            Self::InvalidSignature => "Invalid Signature",
            Self::AudienceMismatch => "Audience Mismatch",
            Self::NonceMismatch => "Nonce Mismatch",
            Self::KeyUnavailable => "Key Unavailable",
            Self::MissingClaim => "Missing Claim",
            Self::UntrustedIssuer => "Untrusted Issuer",
            Self::NoSignatureFound => "No Signature Found",
            Self::SignatureMismatch => "Signature Mismatch",
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for DenialReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// One mechanism's result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MechanismOutcome {
    /// Whether the mechanism verified
    pub verified: bool,
    /// Roles granted (empty unless verified)
    pub roles: BTreeSet<String>,
    /// Why it did not verify
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenialReason>,
    /// Whether the chain link is required
    pub required: bool,
}

impl MechanismOutcome {
    /// Verified with `roles`
    #[must_use]
    pub fn verified(roles: BTreeSet<String>) -> Self {
        Self {
            verified: true,
            roles,
            reason: None,
            required: false,
        }
    }

    /// Denied for `reason`
    #[must_use]
    pub fn denied(reason: DenialReason) -> Self {
        Self {
            verified: false,
            roles: BTreeSet::new(),
            reason: Some(reason),
            required: false,
        }
    }
}

/// Aggregated authentication outcome for one request.
///
/// Authenticated iff no required mechanism failed and at least one
/// mechanism verified. Roles are the union over verified mechanisms.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Assertion {
    mechanisms: Vec<(String, MechanismOutcome)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    claims: Option<Claims>,
}

impl Assertion {
    /// Record (or replace) the outcome for `mechanism`
    pub fn record(&mut self, mechanism: &str, outcome: MechanismOutcome) {
        match self.mechanisms.iter_mut().find(|(name, _)| name == mechanism) {
            Some((_, existing)) => {
                let required = existing.required;
                *existing = outcome;
                existing.required |= required;
            }
            None => self.mechanisms.push((mechanism.to_string(), outcome)),
        }
    }

    /// Flag `mechanism` as required
    pub fn set_required(&mut self, mechanism: &str, required: bool) {
        if let Some((_, outcome)) = self.mechanisms.iter_mut().find(|(name, _)| name == mechanism) {
            outcome.required = required;
        }
    }

    /// Record verified token claims
    pub fn set_claims(&mut self, claims: Claims) {
        self.claims = Some(claims);
    }

    /// Verified token claims
    #[must_use]
    pub fn claims(&self) -> Option<&Claims> {
        self.claims.as_ref()
    }

    /// Outcome for `mechanism`
    #[must_use]
    pub fn outcome(&self, mechanism: &str) -> Option<&MechanismOutcome> {
        self.mechanisms
            .iter()
            .find(|(name, _)| name == mechanism)
            .map(|(_, o)| o)
    }

    /// Outcomes in evaluation order
    pub fn outcomes(&self) -> impl Iterator<Item = (&str, &MechanismOutcome)> {
        self.mechanisms.iter().map(|(n, o)| (n.as_str(), o))
    }

    /// Final verdict
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        let required_failed = self.mechanisms.iter().any(|(_, o)| o.required && !o.verified);
        let any_verified = self.mechanisms.iter().any(|(_, o)| o.verified);
        any_verified && !required_failed
    }

    /// Union of roles over verified mechanisms
    #[must_use]
    pub fn roles(&self) -> BTreeSet<String> {
        self.mechanisms
            .iter()
            .filter(|(_, o)| o.verified)
            .flat_map(|(_, o)| o.roles.iter().cloned())
            .collect()
    }

    /// Names of verified mechanisms, in evaluation order
    #[must_use]
    pub fn verified_mechanisms(&self) -> Vec<String> {
        self.mechanisms
            .iter()
            .filter(|(_, o)| o.verified)
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Reason for a negative verdict; `None` when authenticated.
    ///
    /// A failed required mechanism is reported first; otherwise the first
    /// failed mechanism in evaluation order.
    #[must_use]
    pub fn denial(&self) -> Option<DenialReason> {
        if self.is_authenticated() {
            return None;
        }
        let first_reason = |required_only: bool| {
            self.mechanisms
                .iter()
                .filter(|(_, o)| !o.verified && (!required_only || o.required))
                .find_map(|(_, o)| o.reason)
        };
        Some(
            first_reason(true)
                .or_else(|| first_reason(false))
                .unwrap_or(DenialReason::NoCredentials),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roles(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn empty_assertion_is_denied() {
        let assertion = Assertion::default();
        assert!(!assertion.is_authenticated());
        assert_eq!(assertion.denial(), Some(DenialReason::NoCredentials));
    }

    #[test]
    fn roles_only_from_verified_mechanisms() {
        let mut assertion = Assertion::default();
        assertion.record("jwt", MechanismOutcome::verified(roles(&["a", "b"])));
        let mut failed = MechanismOutcome::denied(DenialReason::SignatureMismatch);
        failed.roles = roles(&["c"]);
        assertion.record("hmac", failed);

        assert!(assertion.is_authenticated());
        assert_eq!(assertion.roles(), roles(&["a", "b"]));
        assert_eq!(assertion.verified_mechanisms(), vec!["jwt".to_string()]);
    }

    #[test]
    fn required_failure_overrides_other_success() {
        let mut assertion = Assertion::default();
        assertion.record("jwt", MechanismOutcome::denied(DenialReason::NoTokenFound));
        assertion.record("hmac", MechanismOutcome::verified(roles(&["svc"])));
        assertion.record("api", MechanismOutcome::denied(DenialReason::SignatureMismatch));
        assertion.set_required("api", true);

        assert!(!assertion.is_authenticated());
        assert_eq!(assertion.denial(), Some(DenialReason::SignatureMismatch));
    }

    #[test]
    fn first_failure_reported_when_nothing_verified() {
        let mut assertion = Assertion::default();
        assertion.record("jwt", MechanismOutcome::denied(DenialReason::TokenExpired));
        assertion.record("hmac", MechanismOutcome::denied(DenialReason::NoSignatureFound));
        assert_eq!(assertion.denial(), Some(DenialReason::TokenExpired));
    }

    #[test]
    fn reasons_serialize_as_text() {
        let json = serde_json::to_value(DenialReason::KeyUnavailable).unwrap();
        assert_eq!(json, "Key Unavailable");
    }
}
