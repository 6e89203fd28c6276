//! Bearer token decoding
//!
//! Decoding is syntactic: the three segments are split, the header and
//! payload are base64url-decoded and parsed, and nothing is verified.
//! Signature checks belong to [`crate::issuer`].

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::Header;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::template::lookup_path;

/// Why a token could not be decoded
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Not three dot-separated segments
    #[error("token must have three segments, found {0}")]
    Segments(usize),

    /// A segment is not base64url
    #[error("{segment} segment is not base64url: {message}")]
    Encoding {
        /// `header`, `payload` or `signature`
        segment: &'static str,
        /// Decoder message
        message: String,
    },

    /// The header is not a JOSE header this crate understands
    #[error("invalid token header: {0}")]
    Header(String),

    /// The payload is not a JSON object of claims
    #[error("invalid token payload: {0}")]
    Payload(String),
}

/// Registered claims plus every other claim in `extra`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Issuer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// Subject
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// Audience (a single string on the wire is normalised to one entry)
    #[serde(
        default,
        deserialize_with = "deserialize_audience",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub aud: Vec<String>,
    /// Issued at (seconds since epoch)
    #[serde(
        default,
        deserialize_with = "deserialize_numeric_date",
        skip_serializing_if = "Option::is_none"
    )]
    pub iat: Option<i64>,
    /// Not before
    #[serde(
        default,
        deserialize_with = "deserialize_numeric_date",
        skip_serializing_if = "Option::is_none"
    )]
    pub nbf: Option<i64>,
    /// Expiry
    #[serde(
        default,
        deserialize_with = "deserialize_numeric_date",
        skip_serializing_if = "Option::is_none"
    )]
    pub exp: Option<i64>,
    /// OpenID nonce
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// All other claims
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Accept `aud` as either a string or an array of strings.
fn deserialize_audience<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Audience {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<Audience>::deserialize(deserializer)? {
        Some(Audience::One(s)) => vec![s],
        Some(Audience::Many(v)) => v,
        None => Vec::new(),
    })
}

/// NumericDate may be fractional; keep whole seconds.
fn deserialize_numeric_date<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumericDate {
        Int(i64),
        Float(f64),
    }

    #[allow(clippy::cast_possible_truncation)]
    Ok(
        Option::<NumericDate>::deserialize(deserializer)?.map(|d| match d {
            NumericDate::Int(i) => i,
            NumericDate::Float(f) => f.floor() as i64,
        }),
    )
}

impl Claims {
    /// Whether `aud` contains any of `allowed`
    #[must_use]
    pub fn audience_matches(&self, allowed: &[String]) -> bool {
        self.aud.iter().any(|a| allowed.iter().any(|e| e == a))
    }
}

/// A decoded (not verified) bearer token
#[derive(Debug, Clone)]
pub struct Credential {
    /// JOSE header
    pub header: Header,
    /// Typed claims
    pub claims: Claims,
    /// The payload as JSON, for claim paths and templates
    pub payload: Value,
    /// Raw base64url signature segment
    pub signature: String,
    /// The full token
    pub raw: String,
}

impl Credential {
    /// Decode a compact JWS token.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if the token is not three base64url segments
    /// with a valid header and a JSON object payload.
    pub fn decode(token: &str) -> Result<Self, DecodeError> {
        let token = token.trim();
        let parts: Vec<&str> = token.split('.').collect();
        if parts.len() != 3 {
            return Err(DecodeError::Segments(parts.len()));
        }

        let header_bytes = decode_segment("header", parts[0])?;
        let header: Header = serde_json::from_slice(&header_bytes)
            .map_err(|e| DecodeError::Header(e.to_string()))?;

        let payload_bytes = decode_segment("payload", parts[1])?;
        let payload: Value = serde_json::from_slice(&payload_bytes)
            .map_err(|e| DecodeError::Payload(e.to_string()))?;
        if !payload.is_object() {
            return Err(DecodeError::Payload("claims must be a JSON object".to_string()));
        }
        let claims: Claims = serde_json::from_value(payload.clone())
            .map_err(|e| DecodeError::Payload(e.to_string()))?;

        decode_segment("signature", parts[2])?;

        Ok(Self {
            header,
            claims,
            payload,
            signature: parts[2].to_string(),
            raw: token.to_string(),
        })
    }

    /// Issuer claim
    #[must_use]
    pub fn issuer(&self) -> Option<&str> {
        self.claims.iss.as_deref()
    }

    /// Key id from the header
    #[must_use]
    pub fn kid(&self) -> Option<&str> {
        self.header.kid.as_deref()
    }

    /// Claim at a dot path in the payload
    #[must_use]
    pub fn claim(&self, path: &str) -> Option<&Value> {
        lookup_path(&self.payload, path)
    }

    /// `now >= exp`. A token without `exp` never expires by this check.
    #[must_use]
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.claims.exp.is_some_and(|exp| now >= exp)
    }

    /// [`is_expired_at`](Self::is_expired_at) against the system clock
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(chrono::Utc::now().timestamp())
    }

    /// `now < nbf`
    #[must_use]
    pub fn is_not_yet_valid_at(&self, now: i64) -> bool {
        self.claims.nbf.is_some_and(|nbf| now < nbf)
    }
}

fn decode_segment(segment: &'static str, data: &str) -> Result<Vec<u8>, DecodeError> {
    URL_SAFE_NO_PAD
        .decode(data.trim_end_matches('='))
        .map_err(|e| DecodeError::Encoding {
            segment,
            message: e.to_string(),
        })
}
