//! Sessions and their persistence through value channels
//!
//! A [`Session`] is a key/value bag with a stable id. The [`SessionManager`]
//! reads it from a [`ValueChannel`] at request start and writes it back at
//! termination, only when it changed. The secure variant seals the document
//! with a [`CryptoBox`] first.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::audit::{self, AuditEvent};
use crate::channel::ValueChannel;
use crate::context::HttpContext;
use crate::crypto::CryptoBox;
use crate::{Error, Result};

/// Persisted document format version
pub const SESSION_FORMAT_VERSION: u32 = 1;

/// Document keys owned by the stored format; [`Session::set`] refuses them.
pub const RESERVED_KEYS: [&str; 2] = ["_v", "id"];

/// Mutable per-request session
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    id: String,
    values: Map<String, Value>,
    is_new: bool,
    dirty: bool,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// Fresh session: new id, `is_new`, dirty.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            values: Map::new(),
            is_new: true,
            dirty: true,
        }
    }

    /// Session restored from a stored document: clean, not new.
    fn restored(id: String, values: Map<String, Value>) -> Self {
        Self {
            id,
            values,
            is_new: false,
            dirty: false,
        }
    }

    /// Session id
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the session was created during this request
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    /// Whether the session must be persisted
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Value for `key`
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// String value for `key`
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    /// All application values
    #[must_use]
    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    /// Set a value; marks the session dirty.
    ///
    /// Keys in [`RESERVED_KEYS`] cannot be stored; the call is logged and
    /// ignored. Returns whether the value was set.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> bool {
        let key = key.into();
        if RESERVED_KEYS.contains(&key.as_str()) {
            warn!(origin = "session", key = %key, "Session key is reserved; value not stored");
            return false;
        }
        self.values.insert(key, value.into());
        self.dirty = true;
        true
    }

    /// Remove a value; marks the session dirty.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.dirty = true;
        self.values.remove(key)
    }

    /// Remove every value; marks the session dirty.
    pub fn clear(&mut self) {
        self.values.clear();
        self.dirty = true;
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }
}

/// Persisted form: `{"_v": 1, "id": "...", ...application keys}`
#[derive(Debug, Serialize, Deserialize)]
struct SessionDocument {
    #[serde(rename = "_v")]
    version: u32,
    id: String,
    #[serde(flatten)]
    values: Map<String, Value>,
}

/// Loads and saves sessions through a value channel
#[derive(Clone)]
pub struct SessionManager {
    channel: ValueChannel,
    key: String,
    create_new: bool,
    crypto: Option<Arc<dyn CryptoBox>>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("channel", &self.channel)
            .field("key", &self.key)
            .field("create_new", &self.create_new)
            .field("secure", &self.crypto.is_some())
            .finish()
    }
}

impl SessionManager {
    /// Plain manager storing the session under `key` on `channel`.
    /// New sessions are created when none is stored.
    pub fn new(channel: ValueChannel, key: impl Into<String>) -> Self {
        Self {
            channel,
            key: key.into(),
            create_new: true,
            crypto: None,
        }
    }

    /// Whether to create a session when none is stored
    #[must_use]
    pub fn create_new(mut self, create_new: bool) -> Self {
        self.create_new = create_new;
        self
    }

    /// Seal stored sessions with `crypto`
    #[must_use]
    pub fn secure(mut self, crypto: Arc<dyn CryptoBox>) -> Self {
        self.crypto = Some(crypto);
        self
    }

    /// Channel the session travels on
    #[must_use]
    pub fn channel(&self) -> &ValueChannel {
        &self.channel
    }

    /// Storage key
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether stored sessions are sealed
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.crypto.is_some()
    }

    /// Load the session for this request.
    ///
    /// A stored value that fails to decrypt or parse is logged and treated
    /// exactly like an absent one.
    pub async fn load(&self, ctx: &HttpContext) -> Option<Session> {
        let restored = match self.channel.read(ctx, &self.key) {
            Some(stored) => match self.decode(&stored).await {
                Ok(session) => Some(session),
                Err(e) => {
                    warn!(origin = "session", key = %self.key, error = %e, "Discarding unreadable session");
                    audit::emit(&AuditEvent::session_corrupt(e.to_string()));
                    None
                }
            },
            None => None,
        };

        match restored {
            Some(session) => {
                debug!(origin = "session", id = %session.id, "Session restored");
                Some(session)
            }
            None if self.create_new => {
                let session = Session::new();
                debug!(origin = "session", id = %session.id, "Session created");
                Some(session)
            }
            None => None,
        }
    }

    /// Persist `session` if it changed.
    ///
    /// Returns whether a write happened. No-op when the session is absent,
    /// clean, or the channel is read-only.
    ///
    /// # Errors
    ///
    /// Propagates serialization, encryption and channel write failures.
    pub async fn save(&self, ctx: &mut HttpContext, session: Option<&mut Session>) -> Result<bool> {
        let Some(session) = session else {
            return Ok(false);
        };
        if !session.dirty {
            return Ok(false);
        }
        if self.channel.is_read_only() {
            debug!(origin = "session", key = %self.key, "Session channel is read-only; not persisting");
            return Ok(false);
        }

        let encoded = self.encode(session).await?;
        self.channel.write(ctx, &self.key, &encoded)?;
        session.mark_clean();
        debug!(origin = "session", id = %session.id, secure = self.is_secure(), "Session persisted");
        Ok(true)
    }

    async fn encode(&self, session: &Session) -> Result<String> {
        let document = SessionDocument {
            version: SESSION_FORMAT_VERSION,
            id: session.id.clone(),
            values: session.values.clone(),
        };
        let json = serde_json::to_string(&document)?;
        match &self.crypto {
            Some(crypto) => crypto.seal(json.as_bytes()).await,
            None => Ok(json),
        }
    }

    async fn decode(&self, stored: &str) -> Result<Session> {
        let json = match &self.crypto {
            Some(crypto) => {
                let plain = crypto
                    .open(stored)
                    .await
                    .map_err(|e| Error::SessionCorrupt(e.to_string()))?;
                String::from_utf8(plain).map_err(|e| Error::SessionCorrupt(e.to_string()))?
            }
            None => stored.to_string(),
        };

        let document: SessionDocument =
            serde_json::from_str(&json).map_err(|e| Error::SessionCorrupt(e.to_string()))?;
        if document.version != SESSION_FORMAT_VERSION {
            return Err(Error::SessionCorrupt(format!(
                "unsupported session format version {}",
                document.version
            )));
        }
        if document.id.is_empty() {
            return Err(Error::SessionCorrupt("session id is empty".to_string()));
        }
        Ok(Session::restored(document.id, document.values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::HttpRequest;
    use crate::cookie::CookieOptions;
    use crate::crypto::AesGcmBox;
    use axum::http::Method;
    use serde_json::json;

    fn empty_ctx() -> HttpContext {
        HttpContext::new(HttpRequest::new(Method::GET, "/"))
    }

    #[test]
    fn new_session_is_dirty_and_new() {
        let session = Session::new();
        assert!(session.is_new());
        assert!(session.is_dirty());
        assert!(uuid::Uuid::parse_str(session.id()).is_ok());
    }

    #[test]
    fn reserved_keys_are_refused() {
        let mut session = Session::restored("id".to_string(), Map::new());
        assert!(!session.set("id", "other"));
        assert!(!session.set("_v", 2));
        assert!(session.get("id").is_none());
        assert!(!session.is_dirty());
        assert!(session.set("ident", "ok"));
        assert!(session.is_dirty());
    }

    #[test]
    fn mutations_mark_dirty() {
        let mut session = Session::restored("id".to_string(), Map::new());
        assert!(!session.is_dirty());
        session.set("count", 1);
        assert!(session.is_dirty());
        session.mark_clean();
        session.remove("count");
        assert!(session.is_dirty());
    }

    #[tokio::test]
    async fn absent_without_create_new_is_none() {
        let manager = SessionManager::new(ValueChannel::Header, "x-session").create_new(false);
        assert!(manager.load(&empty_ctx()).await.is_none());
    }

    #[tokio::test]
    async fn save_writes_flat_versioned_document() {
        let manager = SessionManager::new(ValueChannel::Body, "session");
        let mut ctx = empty_ctx();
        let mut session = Session::new();
        session.set("user", "alice");

        assert!(manager.save(&mut ctx, Some(&mut session)).await.unwrap());
        assert!(!session.is_dirty());

        let stored = ctx.response.body.as_ref().unwrap()["session"].as_str().unwrap();
        let doc: Value = serde_json::from_str(stored).unwrap();
        assert_eq!(doc["_v"], json!(1));
        assert_eq!(doc["id"], json!(session.id()));
        assert_eq!(doc["user"], json!("alice"));
    }

    #[tokio::test]
    async fn clean_session_is_not_written() {
        let manager = SessionManager::new(ValueChannel::Header, "x-session");
        let mut ctx = empty_ctx();
        let mut session = Session::restored("id".to_string(), Map::new());
        assert!(!manager.save(&mut ctx, Some(&mut session)).await.unwrap());
        assert!(!manager.save(&mut ctx, None).await.unwrap());
        assert!(ctx.response.headers.is_empty());
    }

    #[tokio::test]
    async fn read_only_channel_never_writes() {
        let manager = SessionManager::new(ValueChannel::Query, "s");
        let mut ctx = empty_ctx();
        let mut session = Session::new();
        assert!(!manager.save(&mut ctx, Some(&mut session)).await.unwrap());
        assert!(session.is_dirty());
    }

    #[tokio::test]
    async fn corrupt_value_treated_as_absent() {
        let manager = SessionManager::new(ValueChannel::Cookie(CookieOptions::default()), "sid")
            .secure(Arc::new(AesGcmBox::from_secret("k").unwrap()));
        let request = HttpRequest::new(Method::GET, "/")
            .with_header("cookie", "sid=garbage")
            .unwrap();
        let ctx = HttpContext::new(request);

        let session = manager.load(&ctx).await.unwrap();
        assert!(session.is_new());

        let strict = manager.clone().create_new(false);
        assert!(strict.load(&ctx).await.is_none());
    }

    #[tokio::test]
    async fn unknown_version_rejected() {
        let manager = SessionManager::new(ValueChannel::Header, "x-session").create_new(false);
        let request = HttpRequest::new(Method::GET, "/")
            .with_header("x-session", r#"{"_v":2,"id":"abc"}"#)
            .unwrap();
        assert!(manager.load(&HttpContext::new(request)).await.is_none());
    }
}
