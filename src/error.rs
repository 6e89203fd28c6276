//! Error types for authgate

use std::io;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Result type alias for authgate
pub type Result<T> = std::result::Result<T, Error>;

/// authgate errors
///
/// Authentication denial is deliberately absent: mechanisms report a verdict
/// and a reason on the [`Assertion`](crate::authenticator::Assertion), not an
/// error value.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed issuer, session, HMAC or server configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Write attempted on a read-only value channel
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Body path write through a missing intermediate segment
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Cookie violating the cookie model (e.g. empty name)
    #[error("Invalid cookie: {0}")]
    InvalidCookie(String),

    /// Stored session could not be decrypted or parsed
    #[error("Session corrupt: {0}")]
    SessionCorrupt(String),

    /// Encryption or decryption failure
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Discovery document or key set fetch failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Request body could not be read or parsed
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Structured error response rendered by the context lifecycle.
///
/// The JSON body carries exactly `name`, `message`, `code` (the numeric
/// status) and `cause`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpError {
    /// HTTP status code
    pub status: StatusCode,
    /// Error class name (e.g. `AuthenticationDenied`)
    pub name: &'static str,
    /// Human-readable message
    pub message: String,
    /// Optional underlying cause (the immediate error message only)
    pub cause: Option<String>,
}

#[derive(Serialize)]
struct HttpErrorBody<'a> {
    name: &'a str,
    message: &'a str,
    code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    cause: Option<&'a str>,
}

impl HttpError {
    /// 401: any verification failure
    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            name: "AuthenticationDenied",
            message: reason.into(),
            cause: None,
        }
    }

    /// 403: authenticated but lacking a required role
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            name: "AuthorizationDenied",
            message: message.into(),
            cause: None,
        }
    }

    /// 400: malformed input
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            name: "MalformedRequest",
            message: message.into(),
            cause: None,
        }
    }

    /// 500: anything else
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            name: "InternalError",
            message: message.into(),
            cause: None,
        }
    }

    /// Attach a cause
    #[must_use]
    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Render the JSON body
    #[must_use]
    pub fn body(&self) -> serde_json::Value {
        serde_json::to_value(HttpErrorBody {
            name: self.name,
            message: &self.message,
            code: self.status.as_u16(),
            cause: self.cause.as_deref(),
        })
        .unwrap_or_default()
    }
}

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.name, self.status.as_u16(), self.message)
    }
}

impl From<Error> for HttpError {
    fn from(err: Error) -> Self {
        match err {
            Error::MalformedRequest(msg) => Self::bad_request(msg),
            Error::Json(e) => Self::bad_request("Request body is not valid JSON")
                .with_cause(e.to_string()),
            other => Self::internal("Internal server error").with_cause(other.to_string()),
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = self.body();
        if status == StatusCode::UNAUTHORIZED {
            (status, [("WWW-Authenticate", "Bearer")], Json(body)).into_response()
        } else {
            (status, Json(body)).into_response()
        }
    }
}
