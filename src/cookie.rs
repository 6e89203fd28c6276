//! Cookie model, `Cookie` header parsing and `Set-Cookie` serialization
//!
//! A [`Cookie`] carries an explicit dirty flag: cookies parsed from the
//! request start clean and are never re-emitted unless their value or
//! options change. Explicitly created cookies start dirty.

use axum_extra::extract::cookie::{
    Cookie as WireCookie, Expiration, SameSite as WireSameSite,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{Error, Result};

/// `SameSite` cookie attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SameSite {
    /// `SameSite=Strict`
    Strict,
    /// `SameSite=Lax`
    Lax,
    /// `SameSite=None`
    None,
}

impl From<SameSite> for WireSameSite {
    fn from(value: SameSite) -> Self {
        match value {
            SameSite::Strict => Self::Strict,
            SameSite::Lax => Self::Lax,
            SameSite::None => Self::None,
        }
    }
}

/// Cookie attributes emitted with `Set-Cookie`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CookieOptions {
    /// `Max-Age` in seconds
    pub max_age: Option<i64>,
    /// `Expires` instant
    pub expires: Option<DateTime<Utc>>,
    /// `HttpOnly` flag
    pub http_only: bool,
    /// `Domain` attribute
    pub domain: Option<String>,
    /// `Path` attribute
    pub path: Option<String>,
    /// `Secure` flag
    pub secure: bool,
    /// `SameSite` attribute
    pub same_site: Option<SameSite>,
}

impl CookieOptions {
    /// Check that every attribute can be emitted without altering the
    /// `Set-Cookie` line.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCookie`] if `Domain` or `Path` contains `;` or
    /// control characters, or `Expires` is outside the representable range.
    pub fn validate(&self) -> Result<()> {
        for (attribute, text) in [("Domain", &self.domain), ("Path", &self.path)] {
            if let Some(text) = text
                && !is_attribute_text(text)
            {
                return Err(Error::InvalidCookie(format!(
                    "{attribute} attribute contains forbidden characters: {text:?}"
                )));
            }
        }
        if let Some(expires) = self.expires {
            to_offset(expires)?;
        }
        Ok(())
    }
}

/// RFC 6265 cookie-name: a token, no separators or controls.
fn is_cookie_name(name: &str) -> bool {
    !name.is_empty()
        && name.bytes().all(|b| {
            b.is_ascii_graphic() && !b"()<>@,;:\\\"/[]?={}".contains(&b)
        })
}

/// RFC 6265 attribute value: any character except controls and `;`.
fn is_attribute_text(text: &str) -> bool {
    !text.chars().any(|c| c.is_control() || c == ';')
}

fn to_offset(instant: DateTime<Utc>) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(instant.timestamp())
        .map_err(|e| Error::InvalidCookie(format!("Expires out of range: {e}")))
}

/// A single cookie with dirty tracking
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    name: String,
    value: Option<String>,
    options: CookieOptions,
    dirty: bool,
}

impl Cookie {
    /// Create a new cookie. New cookies are dirty and will be emitted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCookie`] if `name` is not an RFC 6265 token.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if !is_cookie_name(&name) {
            return Err(Error::InvalidCookie(format!("invalid cookie name: {name:?}")));
        }
        Ok(Self {
            name,
            value: Some(value.into()),
            options: CookieOptions::default(),
            dirty: true,
        })
    }

    /// Cookie as received from the request: clean.
    fn parsed(name: String, value: String) -> Self {
        Self {
            name,
            value: Some(value),
            options: CookieOptions::default(),
            dirty: false,
        }
    }

    /// Cookie name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cookie value (`None` once deleted)
    #[must_use]
    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    /// Cookie attributes
    #[must_use]
    pub fn options(&self) -> &CookieOptions {
        &self.options
    }

    /// Whether this cookie must be re-serialized into the response
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Replace the value; marks the cookie dirty.
    pub fn set_value(&mut self, value: impl Into<String>) {
        self.value = Some(value.into());
        self.dirty = true;
    }

    /// Replace all attributes; marks the cookie dirty.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCookie`] if the attributes fail
    /// [`CookieOptions::validate`]; the cookie is left unchanged.
    pub fn set_options(&mut self, options: CookieOptions) -> Result<()> {
        options.validate()?;
        self.options = options;
        self.dirty = true;
        Ok(())
    }

    /// Builder-style attribute assignment for new cookies.
    ///
    /// # Errors
    ///
    /// Same as [`Cookie::set_options`].
    pub fn with_options(mut self, options: CookieOptions) -> Result<Self> {
        self.set_options(options)?;
        Ok(self)
    }

    /// Delete the cookie on the client: clears the value and expires it at
    /// the Unix epoch.
    pub fn delete(&mut self) {
        self.value = None;
        self.options.expires = Some(DateTime::<Utc>::UNIX_EPOCH);
        self.options.max_age = None;
        self.dirty = true;
    }

    /// Clear the dirty flag after the cookie has been emitted.
    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Render as a `Set-Cookie` header value. Name and value are
    /// percent-encoded.
    #[must_use]
    pub fn serialize(&self) -> String {
        let opts = &self.options;
        let mut wire = WireCookie::new(
            self.name.clone(),
            self.value.clone().unwrap_or_default(),
        );
        if let Some(max_age) = opts.max_age {
            wire.set_max_age(time::Duration::seconds(max_age));
        }
        if let Some(domain) = &opts.domain {
            wire.set_domain(domain.clone());
        }
        if let Some(path) = &opts.path {
            wire.set_path(path.clone());
        }
        // Validated on the way in; an unconvertible instant is left out
        if let Some(expires) = opts.expires.and_then(|e| to_offset(e).ok()) {
            wire.set_expires(Expiration::DateTime(expires));
        }
        if opts.http_only {
            wire.set_http_only(true);
        }
        if opts.secure {
            wire.set_secure(true);
        }
        if let Some(same_site) = opts.same_site {
            wire.set_same_site(WireSameSite::from(same_site));
        }
        wire.encoded().to_string()
    }
}

/// Parse a `Cookie` request header into clean cookies.
///
/// Malformed pairs are skipped. Values are percent-decoded; surrounding
/// double quotes are removed.
#[must_use]
pub fn parse_cookies(header: &str) -> Vec<Cookie> {
    WireCookie::split_parse_encoded(header)
        .filter_map(std::result::Result::ok)
        .map(|c| {
            let value = c.value();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            Cookie::parsed(c.name().to_string(), value.to_string())
        })
        .collect()
}

/// Request-scoped cookie collection
#[derive(Debug, Clone, Default)]
pub struct CookieJar {
    cookies: Vec<Cookie>,
}

impl CookieJar {
    /// Build a jar from an optional `Cookie` header. When a name repeats, the
    /// first occurrence wins.
    #[must_use]
    pub fn from_header(header: Option<&str>) -> Self {
        let mut jar = Self::default();
        for cookie in header.map(parse_cookies).unwrap_or_default() {
            if jar.get(cookie.name()).is_none() {
                jar.cookies.push(cookie);
            }
        }
        jar
    }

    /// Look up a cookie by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Cookie> {
        self.cookies.iter().find(|c| c.name == name)
    }

    /// Mutable lookup by name
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Cookie> {
        self.cookies.iter_mut().find(|c| c.name == name)
    }

    /// Value of a live cookie
    #[must_use]
    pub fn value(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Cookie::value)
    }

    /// Set a cookie value with the given attributes, creating it if absent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCookie`] if `name` is not a valid cookie name
    /// or `options` fail validation.
    pub fn set(&mut self, name: &str, value: &str, options: &CookieOptions) -> Result<()> {
        if let Some(cookie) = self.get_mut(name) {
            cookie.set_options(options.clone())?;
            cookie.set_value(value);
            return Ok(());
        }
        self.cookies
            .push(Cookie::new(name, value)?.with_options(options.clone())?);
        Ok(())
    }

    /// Insert or replace a whole cookie.
    pub fn insert(&mut self, cookie: Cookie) {
        if let Some(existing) = self.get_mut(cookie.name()) {
            *existing = cookie;
        } else {
            self.cookies.push(cookie);
        }
    }

    /// Delete a cookie on the client. Returns `false` if the jar never held it.
    pub fn delete(&mut self, name: &str) -> bool {
        match self.get_mut(name) {
            Some(cookie) => {
                cookie.delete();
                true
            }
            None => false,
        }
    }

    /// All cookies in the jar
    pub fn iter(&self) -> impl Iterator<Item = &Cookie> {
        self.cookies.iter()
    }

    /// Cookies that must be emitted
    pub fn dirty(&self) -> impl Iterator<Item = &Cookie> {
        self.cookies.iter().filter(|c| c.dirty)
    }

    /// Serialize every dirty cookie to a `Set-Cookie` value and mark it clean.
    pub fn drain_set_cookie_headers(&mut self) -> Vec<String> {
        self.cookies
            .iter_mut()
            .filter(|c| c.dirty)
            .map(|c| {
                let header = c.serialize();
                c.mark_clean();
                header
            })
            .collect()
    }
}
