//! axum binding
//!
//! [`guard_middleware`] runs the request lifecycle around any axum handler.
//! Handlers receive the [`Identity`] and a [`SessionHandle`] as request
//! extensions; headers, cookies and body values written by the core are
//! merged into the handler's response.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    body::{Body, to_bytes},
    extract::{Request, State},
    http::{HeaderValue, StatusCode, header::CONTENT_TYPE},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::context::{HttpContext, HttpRequest, Identity};
use crate::error::HttpError;
use crate::lifecycle::{Guard, LifecycleState};
use crate::session::Session;
use crate::{Error, Result};

/// Shared access to the request session from a handler
#[derive(Debug, Clone, Default)]
pub struct SessionHandle(Arc<Mutex<Option<Session>>>);

impl SessionHandle {
    fn new(session: Option<Session>) -> Self {
        Self(Arc::new(Mutex::new(session)))
    }

    fn take(&self) -> Option<Session> {
        self.0.lock().take()
    }

    /// Whether a session exists for this request
    #[must_use]
    pub fn is_present(&self) -> bool {
        self.0.lock().is_some()
    }

    /// Run `f` with the session, if any
    pub fn with<R>(&self, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        self.0.lock().as_mut().map(f)
    }
}

/// Authenticate the request, run the handler, persist session and cookies.
pub async fn guard_middleware(
    State(guard): State<Arc<Guard>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();
    let Ok(bytes) = to_bytes(body, guard.body_limit()).await else {
        return HttpError::bad_request(format!(
            "Request body unreadable or larger than {} bytes",
            guard.body_limit()
        ))
        .into_response();
    };

    let mut ctx = HttpContext::new(HttpRequest::from_parts(&parts, bytes.clone()));

    let mut outcome = guard.begin(&mut ctx).await;
    if outcome.is_ok() {
        outcome = guard.authenticate(&mut ctx).await;
    }

    let handler_response = match outcome {
        Ok(()) => {
            ctx.state = LifecycleState::Processing;
            let handle = SessionHandle::new(ctx.session.take());
            let mut request = Request::from_parts(parts, Body::from(bytes));
            request.extensions_mut().insert(ctx.identity());
            request.extensions_mut().insert(handle.clone());

            let response = next.run(request).await;
            ctx.session = handle.take();
            Some(response)
        }
        Err(e) => {
            ctx.fail(&e);
            None
        }
    };

    if let Err(e) = guard.terminate(&mut ctx).await {
        error!(origin = "lifecycle", error = %e, "Termination failed");
        return HttpError::from(e).into_response();
    }

    match handler_response {
        Some(response) => merge_into(response, ctx).await,
        None => render(ctx),
    }
}

/// Response built entirely from the context (error path).
fn render(ctx: HttpContext) -> Response {
    let mut response = match ctx.response.body {
        Some(body) => (ctx.response.status, Json(body)).into_response(),
        None => ctx.response.status.into_response(),
    };
    response.headers_mut().extend(ctx.response.headers);
    response
}

/// Merge core-written headers and body values into the handler response.
async fn merge_into(response: Response, ctx: HttpContext) -> Response {
    let (mut parts, body) = response.into_parts();
    parts.headers.extend(ctx.response.headers);

    let Some(Value::Object(extra)) = ctx.response.body else {
        return Response::from_parts(parts, body);
    };

    let is_json = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("json"));
    let bytes = match to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(origin = "lifecycle", error = %e, "Failed to read handler response");
            return HttpError::internal("Internal server error").into_response();
        }
    };

    let mut document = if bytes.is_empty() {
        Map::new()
    } else if is_json {
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Object(map)) => map,
            _ => {
                warn!(origin = "lifecycle", "Handler body is not a JSON object; body values dropped");
                return Response::from_parts(parts, Body::from(bytes));
            }
        }
    } else {
        warn!(origin = "lifecycle", "Handler body is not JSON; body values dropped");
        return Response::from_parts(parts, Body::from(bytes));
    };

    document.extend(extra);
    let encoded = match serde_json::to_vec(&Value::Object(document)) {
        Ok(encoded) => encoded,
        Err(e) => return HttpError::from(Error::from(e)).into_response(),
    };
    parts
        .headers
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    parts.headers.remove(axum::http::header::CONTENT_LENGTH);
    Response::from_parts(parts, Body::from(encoded))
}

/// Demo router: `/health` is open, `/whoami` is guarded.
pub fn router(guard: Arc<Guard>) -> Router {
    Router::new()
        .route("/whoami", get(whoami).post(whoami))
        .layer(middleware::from_fn_with_state(guard, guard_middleware))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

async fn whoami(
    Extension(identity): Extension<Identity>,
    Extension(session): Extension<SessionHandle>,
) -> impl IntoResponse {
    let visits = session.with(|s| {
        let visits = s.get("visits").and_then(Value::as_u64).unwrap_or(0) + 1;
        s.set("visits", visits);
        visits
    });
    Json(json!({
        "identity": identity,
        "session": visits.map(|v| json!({ "visits": v })),
    }))
}

/// Serve the demo router until Ctrl+C / SIGTERM.
///
/// # Errors
///
/// Returns an error if the guard cannot be built or the listener fails.
pub async fn serve(config: Config) -> Result<()> {
    let guard = Arc::new(config.build_guard()?);
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| Error::Config(format!("Invalid listen address: {e}")))?;

    let listener = TcpListener::bind(addr).await?;
    info!(
        host = %config.server.host,
        port = config.server.port,
        mechanisms = guard.chain().links().len(),
        sessions = guard.sessions().is_some(),
        "authgate listening"
    );

    axum::serve(listener, router(guard))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;

    info!("authgate stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
