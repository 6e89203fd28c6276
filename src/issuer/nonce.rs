//! Sources of the nonce a token is expected to carry

use async_trait::async_trait;

use crate::context::HttpContext;
use crate::credential::Credential;

/// Supplies the nonce expected for a request.
///
/// Returning `None` skips the nonce check for that request.
#[async_trait]
pub trait NonceSource: Send + Sync + 'static {
    /// Expected nonce, if any
    async fn expected_nonce(&self, ctx: &HttpContext, credential: &Credential) -> Option<String>;
}

/// Never supplies a nonce
#[derive(Debug, Clone, Copy, Default)]
pub struct NoNonce;

#[async_trait]
impl NonceSource for NoNonce {
    async fn expected_nonce(&self, _ctx: &HttpContext, _credential: &Credential) -> Option<String> {
        None
    }
}

/// Reads the expected nonce from a session value
#[derive(Debug, Clone)]
pub struct SessionNonce {
    key: String,
}

impl SessionNonce {
    /// Nonce stored under `key` in the request session
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

#[async_trait]
impl NonceSource for SessionNonce {
    async fn expected_nonce(&self, ctx: &HttpContext, _credential: &Credential) -> Option<String> {
        ctx.session
            .as_ref()
            .and_then(|s| s.get_str(&self.key))
            .map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::HttpRequest;
    use crate::session::Session;
    use axum::http::Method;
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    fn credential() -> Credential {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256"}"#);
        let payload = URL_SAFE_NO_PAD.encode(br#"{"nonce":"n"}"#);
        Credential::decode(&format!("{header}.{payload}.c2ln")).unwrap()
    }

    #[tokio::test]
    async fn session_nonce_reads_session_value() {
        let mut ctx = HttpContext::new(HttpRequest::new(Method::GET, "/"));
        let source = SessionNonce::new("oidc_nonce");
        assert_eq!(source.expected_nonce(&ctx, &credential()).await, None);

        let mut session = Session::new();
        session.set("oidc_nonce", "n-123");
        ctx.session = Some(session);
        assert_eq!(
            source.expected_nonce(&ctx, &credential()).await.as_deref(),
            Some("n-123")
        );
        assert_eq!(NoNonce.expected_nonce(&ctx, &credential()).await, None);
    }
}
