//! Audit logging for authentication decisions.
//!
//! Every event is emitted via `tracing` with a single serialized `audit`
//! field, so the trail is queryable by any log aggregator.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `auth.verified` | The chain produced a positive verdict |
//! | `auth.denied` | The chain produced a negative verdict (401) |
//! | `auth.forbidden` | Authenticated, but no required role held (403) |
//! | `issuer.signature_invalid` | A token claiming a trusted issuer failed its signature check |
//! | `session.corrupt` | A stored session could not be decrypted or parsed |

use std::collections::BTreeSet;

use serde::Serialize;

/// Structured audit event
#[derive(Debug, Serialize)]
pub struct AuditEvent {
    /// Event type string (e.g., `"auth.denied"`).
    pub event: &'static str,
    /// Request path, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Token subject, when a token was decoded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Issuer name involved in the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    /// Mechanisms that verified.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mechanisms: Vec<String>,
    /// Roles granted.
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub roles: BTreeSet<String>,
    /// Human-readable reason for denial events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    fn new(event: &'static str) -> Self {
        Self {
            event,
            path: None,
            subject: None,
            issuer: None,
            mechanisms: Vec::new(),
            roles: BTreeSet::new(),
            reason: None,
        }
    }

    /// `auth.verified`
    #[must_use]
    pub fn verified(
        path: &str,
        subject: Option<&str>,
        mechanisms: Vec<String>,
        roles: BTreeSet<String>,
    ) -> Self {
        Self {
            path: Some(path.to_string()),
            subject: subject.map(str::to_string),
            mechanisms,
            roles,
            ..Self::new("auth.verified")
        }
    }

    /// `auth.denied`
    #[must_use]
    pub fn denied(path: &str, reason: impl Into<String>) -> Self {
        Self {
            path: Some(path.to_string()),
            reason: Some(reason.into()),
            ..Self::new("auth.denied")
        }
    }

    /// `auth.forbidden`
    #[must_use]
    pub fn forbidden(path: &str, subject: Option<&str>, roles: BTreeSet<String>) -> Self {
        Self {
            path: Some(path.to_string()),
            subject: subject.map(str::to_string),
            roles,
            reason: Some("missing required role".to_string()),
            ..Self::new("auth.forbidden")
        }
    }

    /// `issuer.signature_invalid`
    #[must_use]
    pub fn signature_invalid(issuer: &str, subject: Option<&str>, reason: impl Into<String>) -> Self {
        Self {
            issuer: Some(issuer.to_string()),
            subject: subject.map(str::to_string),
            reason: Some(reason.into()),
            ..Self::new("issuer.signature_invalid")
        }
    }

    /// `session.corrupt`
    #[must_use]
    pub fn session_corrupt(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::new("session.corrupt")
        }
    }

    /// Whether this event reports a failure (emitted at `warn`).
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.event != "auth.verified"
    }
}

/// Emit an audit event.
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) if event.is_failure() => tracing::warn!(audit = %json, event = event.event, "authgate audit"),
        Ok(ref json) => tracing::info!(audit = %json, event = event.event, "authgate audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}
