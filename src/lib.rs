//! authgate
//!
//! Authentication and session middleware for serverless-style HTTP handlers.
//!
//! # Features
//!
//! - **Authenticator chain**: JWT bearer tokens and HMAC body signatures,
//!   OR-combined with optional required links
//! - **Issuers**: static keys and OpenID discovery with `{claim}` URL
//!   templating and JWKS `kid` selection (including `x5c` chains)
//! - **Sessions**: JSON documents carried in a header, cookie or body field,
//!   optionally sealed with AES-256-GCM
//! - **Lifecycle**: cookie parsing, session load and save, structured error
//!   responses and an axum middleware binding

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod authenticator;
pub mod channel;
pub mod cli;
pub mod config;
pub mod context;
pub mod cookie;
pub mod credential;
pub mod crypto;
pub mod error;
pub mod issuer;
pub mod lifecycle;
pub mod server;
pub mod session;
pub mod template;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
    }
}
