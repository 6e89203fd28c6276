//! Cookie and session persistence tests

use std::sync::Arc;

use axum::http::{Method, header::SET_COOKIE};
use pretty_assertions::assert_eq;
use serde_json::json;

use authgate::channel::ValueChannel;
use authgate::context::{HttpContext, HttpRequest};
use authgate::cookie::{Cookie, CookieOptions, SameSite, parse_cookies};
use authgate::crypto::AesGcmBox;
use authgate::session::{Session, SessionManager};

#[test]
fn cookie_serialize_then_parse_recovers_pair() {
    let cases = [
        ("sid", "abc123"),
        ("token", "a b;c=d,e"),
        ("json", r#"{"k":"v"}"#),
        ("empty", ""),
    ];
    for (name, value) in cases {
        let cookie = Cookie::new(name, value)
            .unwrap()
            .with_options(CookieOptions {
                max_age: Some(60),
                http_only: true,
                path: Some("/".to_string()),
                secure: true,
                same_site: Some(SameSite::Lax),
                ..CookieOptions::default()
            })
            .unwrap();
        let header = cookie.serialize();
        let first = header.split(';').next().unwrap();

        let parsed = parse_cookies(first);
        assert_eq!(parsed.len(), 1, "{header}");
        assert_eq!(parsed[0].name(), name);
        assert_eq!(parsed[0].value(), Some(value));
    }
}

/// Move the Set-Cookie pair written on `ctx` into a new request's Cookie header
fn carry_cookie(ctx: &mut HttpContext) -> HttpRequest {
    let set_cookie = ctx.cookies.drain_set_cookie_headers();
    let pair = set_cookie[0].split(';').next().unwrap().to_string();
    HttpRequest::new(Method::GET, "/")
        .with_header("cookie", &format!("other=1; {pair}"))
        .unwrap()
}

#[tokio::test]
async fn plain_cookie_session_round_trip() {
    let manager = SessionManager::new(ValueChannel::Cookie(CookieOptions::default()), "sid");
    let mut ctx = HttpContext::new(HttpRequest::new(Method::GET, "/"));

    let mut session = manager.load(&ctx).await.unwrap();
    assert!(session.is_new());
    session.set("user", "alice");
    session.set("cart", json!({ "items": [1, 2, 3] }));
    assert!(manager.save(&mut ctx, Some(&mut session)).await.unwrap());

    let next = HttpContext::new(carry_cookie(&mut ctx));
    let restored = manager.load(&next).await.unwrap();

    assert!(!restored.is_new());
    assert!(!restored.is_dirty());
    assert_eq!(restored.id(), session.id());
    assert_eq!(restored.values(), session.values());
}

#[tokio::test]
async fn secure_header_session_round_trip() {
    let crypto = Arc::new(AesGcmBox::from_secret("session-secret").unwrap());
    let manager = SessionManager::new(ValueChannel::Header, "x-session").secure(crypto);
    let mut ctx = HttpContext::new(HttpRequest::new(Method::GET, "/"));

    let mut session = Session::new();
    session.set("nonce", "n-123");
    manager.save(&mut ctx, Some(&mut session)).await.unwrap();

    let sealed = ctx.response.headers["x-session"].to_str().unwrap().to_string();
    assert!(!sealed.contains("n-123"));

    let next = HttpContext::new(
        HttpRequest::new(Method::GET, "/")
            .with_header("x-session", &sealed)
            .unwrap(),
    );
    let restored = manager.load(&next).await.unwrap();
    assert!(!restored.is_new());
    assert!(!restored.is_dirty());
    assert_eq!(restored.get_str("nonce"), Some("n-123"));
}

#[tokio::test]
async fn clean_session_is_not_written() {
    let manager = SessionManager::new(ValueChannel::Cookie(CookieOptions::default()), "sid");
    let mut first = HttpContext::new(HttpRequest::new(Method::GET, "/"));
    let mut session = Session::new();
    session.set("k", 1);
    manager.save(&mut first, Some(&mut session)).await.unwrap();

    let mut ctx = HttpContext::new(carry_cookie(&mut first));
    let mut loaded = manager.load(&ctx).await.unwrap();
    let _ = loaded.get("k");

    assert!(!manager.save(&mut ctx, Some(&mut loaded)).await.unwrap());
    assert!(ctx.cookies.drain_set_cookie_headers().is_empty());
    assert!(ctx.response.headers.get(SET_COOKIE).is_none());
}

#[tokio::test]
async fn session_sealed_under_another_key_is_discarded() {
    let writer = SessionManager::new(ValueChannel::Header, "x-session")
        .secure(Arc::new(AesGcmBox::from_secret("one").unwrap()));
    let reader = SessionManager::new(ValueChannel::Header, "x-session")
        .secure(Arc::new(AesGcmBox::from_secret("two").unwrap()))
        .create_new(false);

    let mut ctx = HttpContext::new(HttpRequest::new(Method::GET, "/"));
    let mut session = Session::new();
    writer.save(&mut ctx, Some(&mut session)).await.unwrap();
    let sealed = ctx.response.headers["x-session"].to_str().unwrap().to_string();

    let next = HttpContext::new(
        HttpRequest::new(Method::GET, "/")
            .with_header("x-session", &sealed)
            .unwrap(),
    );
    assert!(reader.load(&next).await.is_none());
}
