//! Per-request orchestration
//!
//! ```text
//! INIT -> (parse body, load session) -> AUTHENTICATING -> AUTHENTICATED | DENIED
//!      -> PROCESSING -> TERMINATING (persist session, emit dirty cookies) -> DONE
//! ```
//!
//! Termination runs whatever happened before it, including error paths.

use std::collections::BTreeSet;

use axum::http::{HeaderValue, header::SET_COOKIE};
use tracing::{debug, error};

use crate::audit::{self, AuditEvent};
use crate::authenticator::{AuthenticatorChain, DenialReason};
use crate::context::{HttpContext, HttpRequest};
use crate::error::HttpError;
use crate::session::SessionManager;
use crate::{Error, Result};

/// Default maximum request body size (1 MiB)
pub const DEFAULT_BODY_LIMIT: usize = 1024 * 1024;

/// Lifecycle state of one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Context created
    Init,
    /// Running the authenticator chain
    Authenticating,
    /// Chain verified
    Authenticated,
    /// Chain did not verify
    Denied,
    /// Business logic running
    Processing,
    /// Persisting session and cookies
    Terminating,
    /// Response ready
    Done,
}

/// Immutable per-deployment request guard
#[derive(Debug)]
pub struct Guard {
    chain: AuthenticatorChain,
    sessions: Option<SessionManager>,
    required_roles: BTreeSet<String>,
    enforce: bool,
    body_limit: usize,
}

impl Guard {
    /// Start building a guard around `chain`
    #[must_use]
    pub fn builder(chain: AuthenticatorChain) -> GuardBuilder {
        GuardBuilder {
            guard: Self {
                chain,
                sessions: None,
                required_roles: BTreeSet::new(),
                enforce: true,
                body_limit: DEFAULT_BODY_LIMIT,
            },
        }
    }

    /// Maximum accepted request body size
    #[must_use]
    pub fn body_limit(&self) -> usize {
        self.body_limit
    }

    /// Authenticator chain
    #[must_use]
    pub fn chain(&self) -> &AuthenticatorChain {
        &self.chain
    }

    /// Session manager, if sessions are enabled
    #[must_use]
    pub fn sessions(&self) -> Option<&SessionManager> {
        self.sessions.as_ref()
    }

    /// Parse the body and load the session.
    ///
    /// # Errors
    ///
    /// Returns a 400 [`HttpError`] for an oversized or malformed body.
    pub async fn begin(&self, ctx: &mut HttpContext) -> std::result::Result<(), HttpError> {
        if ctx.request.raw_body.len() > self.body_limit {
            return Err(HttpError::bad_request(format!(
                "Request body exceeds {} bytes",
                self.body_limit
            )));
        }
        ctx.request.parse_body().map_err(HttpError::from)?;

        if let Some(sessions) = &self.sessions {
            ctx.session = sessions.load(ctx).await;
        }
        ctx.state = LifecycleState::Authenticating;
        Ok(())
    }

    /// Run the chain and apply the role gate.
    ///
    /// # Errors
    ///
    /// Returns 401 when the chain denies (if enforcing) and 403 when no
    /// required role is held.
    pub async fn authenticate(&self, ctx: &mut HttpContext) -> std::result::Result<(), HttpError> {
        ctx.assertion = self.chain.evaluate(ctx).await;
        let subject = ctx.assertion.claims().and_then(|c| c.sub.clone());

        if let Some(reason) = ctx.assertion.denial() {
            ctx.state = LifecycleState::Denied;
            audit::emit(&AuditEvent::denied(&ctx.request.path, reason.as_str()));
            if self.enforce {
                return Err(denied(reason));
            }
            debug!(origin = "lifecycle", reason = %reason, "Continuing unauthenticated (not enforcing)");
            return Ok(());
        }

        ctx.state = LifecycleState::Authenticated;
        let roles = ctx.assertion.roles();
        if !self.required_roles.is_empty() && self.required_roles.is_disjoint(&roles) {
            audit::emit(&AuditEvent::forbidden(&ctx.request.path, subject.as_deref(), roles));
            return Err(HttpError::forbidden("Missing required role").with_cause(format!(
                "requires one of: {}",
                self.required_roles.iter().cloned().collect::<Vec<_>>().join(", ")
            )));
        }

        audit::emit(&AuditEvent::verified(
            &ctx.request.path,
            subject.as_deref(),
            ctx.assertion.verified_mechanisms(),
            roles,
        ));
        Ok(())
    }

    /// Persist the session and serialize dirty cookies.
    ///
    /// # Errors
    ///
    /// Propagates session persistence failures and invalid cookie text.
    pub async fn terminate(&self, ctx: &mut HttpContext) -> Result<()> {
        ctx.state = LifecycleState::Terminating;

        if let Some(sessions) = &self.sessions {
            let mut session = ctx.session.take();
            let saved = sessions.save(ctx, session.as_mut()).await;
            ctx.session = session;
            saved?;
        }

        for cookie in ctx.cookies.drain_set_cookie_headers() {
            let value = HeaderValue::from_str(&cookie)
                .map_err(|e| Error::InvalidCookie(format!("Set-Cookie value not valid: {e}")))?;
            ctx.response.headers.append(SET_COOKIE, value);
        }

        ctx.state = LifecycleState::Done;
        Ok(())
    }

    /// Run the full lifecycle around `process`.
    ///
    /// Errors from any step become the structured error response; the
    /// returned context always reached [`LifecycleState::Done`].
    pub async fn handle<F>(&self, request: HttpRequest, process: F) -> HttpContext
    where
        F: AsyncFnOnce(&mut HttpContext) -> std::result::Result<(), HttpError>,
    {
        let mut ctx = HttpContext::new(request);

        let mut outcome = self.begin(&mut ctx).await;
        if outcome.is_ok() {
            outcome = self.authenticate(&mut ctx).await;
        }
        if outcome.is_ok() {
            ctx.state = LifecycleState::Processing;
            outcome = process(&mut ctx).await;
        }
        if let Err(e) = &outcome {
            debug!(origin = "lifecycle", status = e.status.as_u16(), error = %e, "Request failed");
            ctx.fail(e);
        }

        if let Err(e) = self.terminate(&mut ctx).await {
            error!(origin = "lifecycle", error = %e, "Termination failed");
            ctx.fail(&HttpError::from(e));
            ctx.state = LifecycleState::Done;
        }
        ctx
    }
}

fn denied(reason: DenialReason) -> HttpError {
    HttpError::unauthorized(reason.as_str())
}

/// Builder for [`Guard`]
#[derive(Debug)]
pub struct GuardBuilder {
    guard: Guard,
}

impl GuardBuilder {
    /// Enable sessions
    #[must_use]
    pub fn sessions(mut self, sessions: SessionManager) -> Self {
        self.guard.sessions = Some(sessions);
        self
    }

    /// Require at least one of `roles`
    #[must_use]
    pub fn required_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.guard.required_roles = roles.into_iter().map(Into::into).collect();
        self
    }

    /// Whether a denial stops the request (default `true`)
    #[must_use]
    pub fn enforce(mut self, enforce: bool) -> Self {
        self.guard.enforce = enforce;
        self
    }

    /// Maximum request body size
    #[must_use]
    pub fn body_limit(mut self, limit: usize) -> Self {
        self.guard.body_limit = limit;
        self
    }

    /// Finish
    #[must_use]
    pub fn build(self) -> Guard {
        self.guard
    }
}
