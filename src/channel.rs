//! Value channels: one get/set contract over every place a credential or
//! session can travel.
//!
//! | Channel | Read from            | Write to                 |
//! |---------|----------------------|--------------------------|
//! | Header  | request headers      | response headers         |
//! | Cookie  | request cookie jar   | cookie jar (dirty)       |
//! | Query   | request query string | unsupported (read-only)  |
//! | Body    | request JSON body    | response JSON body       |

use axum::http::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::HttpContext;
use crate::cookie::CookieOptions;
use crate::template::{empty_object, lookup_path, value_to_text, write_path};
use crate::{Error, Result};

/// Channel kind, as named in configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// HTTP header
    #[default]
    Header,
    /// Cookie
    Cookie,
    /// Query string parameter
    Query,
    /// Dot path into the JSON body
    Body,
}

/// A transport location for a named value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueChannel {
    /// HTTP header
    Header,
    /// Cookie, written with these attributes
    Cookie(CookieOptions),
    /// Query string (read-only)
    Query,
    /// Dot path into the JSON body
    Body,
}

impl ValueChannel {
    /// Build a channel from its configured kind. Cookie options are only
    /// used by the cookie channel.
    #[must_use]
    pub fn from_kind(kind: ChannelKind, cookie: CookieOptions) -> Self {
        match kind {
            ChannelKind::Header => Self::Header,
            ChannelKind::Cookie => Self::Cookie(cookie),
            ChannelKind::Query => Self::Query,
            ChannelKind::Body => Self::Body,
        }
    }

    /// Channel kind
    #[must_use]
    pub fn kind(&self) -> ChannelKind {
        match self {
            Self::Header => ChannelKind::Header,
            Self::Cookie(_) => ChannelKind::Cookie,
            Self::Query => ChannelKind::Query,
            Self::Body => ChannelKind::Body,
        }
    }

    /// Whether writes are rejected
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::Query)
    }

    /// Read `key` from the request.
    ///
    /// Body reads return `None` on any missing segment or a JSON `null`;
    /// non-string leaves are rendered as JSON text.
    #[must_use]
    pub fn read(&self, ctx: &HttpContext, key: &str) -> Option<String> {
        match self {
            Self::Header => ctx.request.header(key).map(str::to_string),
            Self::Cookie(_) => ctx.cookies.value(key).map(str::to_string),
            Self::Query => ctx.request.query_param(key).map(str::to_string),
            Self::Body => {
                let body = ctx.request.body.as_ref()?;
                match lookup_path(body, key)? {
                    Value::Null => None,
                    v => Some(value_to_text(v)),
                }
            }
        }
    }

    /// Write `key` into the response.
    ///
    /// # Errors
    ///
    /// - [`Error::UnsupportedOperation`] on the query channel
    /// - [`Error::InvalidPath`] when a body path crosses a missing segment
    /// - [`Error::InvalidCookie`] for an invalid cookie name or attributes
    /// - [`Error::Internal`] for header names or values that are not valid
    pub fn write(&self, ctx: &mut HttpContext, key: &str, value: &str) -> Result<()> {
        match self {
            Self::Header => {
                let name = HeaderName::from_bytes(key.as_bytes())
                    .map_err(|e| Error::Internal(format!("Invalid header name '{key}': {e}")))?;
                let value = HeaderValue::from_str(value)
                    .map_err(|e| Error::Internal(format!("Invalid header value for '{key}': {e}")))?;
                ctx.response.headers.insert(name, value);
                Ok(())
            }
            Self::Cookie(options) => ctx.cookies.set(key, value, options),
            Self::Query => Err(Error::UnsupportedOperation(format!(
                "query channel is read-only (write to '{key}')"
            ))),
            Self::Body => {
                let root = ctx.response.body.get_or_insert_with(empty_object);
                write_path(root, key, Value::String(value.to_string()))
            }
        }
    }
}
