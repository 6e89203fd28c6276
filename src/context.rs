//! Request-scoped HTTP context
//!
//! [`HttpContext`] is the boundary between the host binding and the core.
//! The binding fills an [`HttpRequest`]; the core reads credentials from it,
//! writes headers/cookies/body into the [`HttpResponse`], and owns the
//! session and cookie jar for the lifetime of one request.

use axum::http::{
    HeaderMap, HeaderName, HeaderValue, Method, StatusCode,
    header::{CONTENT_TYPE, COOKIE},
};
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;

use crate::authenticator::Assertion;
use crate::cookie::CookieJar;
use crate::credential::Claims;
use crate::error::HttpError;
use crate::lifecycle::LifecycleState;
use crate::session::Session;
use crate::{Error, Result};

/// Inbound request as seen by the core
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// HTTP method
    pub method: Method,
    /// Request path (without query)
    pub path: String,
    /// Request headers
    pub headers: HeaderMap,
    /// Decoded query parameters in order of appearance
    pub query: Vec<(String, String)>,
    /// Raw body bytes (HMAC input)
    pub raw_body: Bytes,
    /// Structured body, parsed from `raw_body` when it is JSON
    pub body: Option<Value>,
}

impl HttpRequest {
    /// Create an empty request
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            query: Vec::new(),
            raw_body: Bytes::new(),
            body: None,
        }
    }

    /// Build from `http` request parts and the collected body.
    #[must_use]
    pub fn from_parts(parts: &axum::http::request::Parts, raw_body: Bytes) -> Self {
        let mut request = Self::new(parts.method.clone(), parts.uri.path());
        request.headers = parts.headers.clone();
        if let Some(query) = parts.uri.query() {
            request = request.with_query(query);
        }
        request.raw_body = raw_body;
        request
    }

    /// Add a header.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedRequest`] if the name or value is not valid
    /// header text.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::MalformedRequest(format!("invalid header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::MalformedRequest(format!("invalid header value: {e}")))?;
        self.headers.append(name, value);
        Ok(self)
    }

    /// Append parameters from a raw query string (`a=1&b=2`).
    #[must_use]
    pub fn with_query(mut self, query: &str) -> Self {
        self.query.extend(
            url::form_urlencoded::parse(query.trim_start_matches('?').as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned())),
        );
        self
    }

    /// Set the raw body.
    #[must_use]
    pub fn with_body(mut self, raw: impl Into<Bytes>) -> Self {
        self.raw_body = raw.into();
        self
    }

    /// First value of a header, if it is valid text
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// First value of a query parameter
    #[must_use]
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn is_json(&self) -> bool {
        self.header(CONTENT_TYPE.as_str())
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("json"))
    }

    /// Parse `raw_body` into `body` when the content type is JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedRequest`] when a JSON body does not parse.
    pub fn parse_body(&mut self) -> Result<()> {
        if self.body.is_some() || self.raw_body.is_empty() || !self.is_json() {
            return Ok(());
        }
        let value = serde_json::from_slice(&self.raw_body)
            .map_err(|e| Error::MalformedRequest(format!("Request body is not valid JSON: {e}")))?;
        self.body = Some(value);
        Ok(())
    }
}

/// Outbound response state accumulated by the core
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Status code (200 unless the lifecycle failed)
    pub status: StatusCode,
    /// Headers written by value channels and termination
    pub headers: HeaderMap,
    /// Structured body written by body-path channels or the error path
    pub body: Option<Value>,
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: None,
        }
    }
}

/// Authentication result handed to business logic
#[derive(Debug, Clone, Default, Serialize)]
pub struct Identity {
    /// Final verdict
    pub authenticated: bool,
    /// Union of roles granted by verified mechanisms
    pub roles: std::collections::BTreeSet<String>,
    /// Claims of the verified bearer token, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claims: Option<Claims>,
    /// Names of the mechanisms that verified
    pub mechanisms: Vec<String>,
}

impl Identity {
    /// Whether the identity carries `role`
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

/// Per-request context
#[derive(Debug)]
pub struct HttpContext {
    /// The inbound request
    pub request: HttpRequest,
    /// The outbound response
    pub response: HttpResponse,
    /// Request cookies plus any cookies set during the request
    pub cookies: CookieJar,
    /// Session for this request, if one was loaded or created
    pub session: Option<Session>,
    /// Authentication outcome
    pub assertion: Assertion,
    pub(crate) state: LifecycleState,
}

impl HttpContext {
    /// Wrap a request. Cookies are parsed from the `Cookie` header.
    #[must_use]
    pub fn new(request: HttpRequest) -> Self {
        let mut ctx = Self {
            request,
            response: HttpResponse::default(),
            cookies: CookieJar::default(),
            session: None,
            assertion: Assertion::default(),
            state: LifecycleState::Init,
        };
        ctx.parse_cookies();
        ctx
    }

    /// (Re)build the cookie jar from every `Cookie` request header.
    pub fn parse_cookies(&mut self) {
        let header = self
            .request
            .headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join("; ");
        self.cookies = CookieJar::from_header((!header.is_empty()).then_some(header.as_str()));
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Snapshot of the authentication outcome
    #[must_use]
    pub fn identity(&self) -> Identity {
        Identity {
            authenticated: self.assertion.is_authenticated(),
            roles: self.assertion.roles(),
            claims: self.assertion.claims().cloned(),
            mechanisms: self.assertion.verified_mechanisms(),
        }
    }

    /// Mutable access to the session, if any
    pub fn session_mut(&mut self) -> Option<&mut Session> {
        self.session.as_mut()
    }

    /// Replace the response with a structured error.
    pub fn fail(&mut self, error: &HttpError) {
        self.response.status = error.status;
        self.response.body = Some(error.body());
        if error.status == StatusCode::UNAUTHORIZED {
            self.response
                .headers
                .insert("www-authenticate", HeaderValue::from_static("Bearer"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cookies_parsed_from_every_cookie_header() {
        let request = HttpRequest::new(Method::GET, "/")
            .with_header("cookie", "a=1")
            .unwrap()
            .with_header("cookie", "b=2")
            .unwrap();
        let ctx = HttpContext::new(request);
        assert_eq!(ctx.cookies.value("a"), Some("1"));
        assert_eq!(ctx.cookies.value("b"), Some("2"));
        assert_eq!(ctx.state(), LifecycleState::Init);
    }

    #[test]
    fn query_parameters_are_decoded() {
        let request = HttpRequest::new(Method::GET, "/").with_query("?token=a%20b&x=1&x=2");
        assert_eq!(request.query_param("token"), Some("a b"));
        assert_eq!(request.query_param("x"), Some("1"));
        assert_eq!(request.query_param("missing"), None);
    }

    #[test]
    fn json_body_parsed_only_for_json_content() {
        let mut request = HttpRequest::new(Method::POST, "/")
            .with_header("content-type", "application/json; charset=utf-8")
            .unwrap()
            .with_body(r#"{"auth":{"token":"t"}}"#);
        request.parse_body().unwrap();
        assert_eq!(request.body, Some(json!({ "auth": { "token": "t" } })));

        let mut plain = HttpRequest::new(Method::POST, "/").with_body("{not json");
        plain.parse_body().unwrap();
        assert!(plain.body.is_none());
    }

    #[test]
    fn malformed_json_body_rejected() {
        let mut request = HttpRequest::new(Method::POST, "/")
            .with_header("content-type", "application/json")
            .unwrap()
            .with_body("{not json");
        assert!(matches!(request.parse_body(), Err(Error::MalformedRequest(_))));
    }

    #[test]
    fn fail_renders_error_into_response() {
        let mut ctx = HttpContext::new(HttpRequest::new(Method::GET, "/"));
        ctx.fail(&HttpError::unauthorized("No Token Found"));
        assert_eq!(ctx.response.status, StatusCode::UNAUTHORIZED);
        assert_eq!(ctx.response.body.as_ref().unwrap()["message"], "No Token Found");
        assert_eq!(ctx.response.headers["www-authenticate"], "Bearer");
    }
}
