//! `timebank serve` -- HTTP JSON API over the handshake engine.
//!
//! Caller identity comes from the `X-User-Id` header set by the
//! authenticating gateway in front of this service.
//!
//! Security features:
//! - CORS headers on all responses (permissive for local dev)
//! - Per-IP rate limiting (default: 60 req/min, TIMEBANK_RATE_LIMIT)
//! - Optional shared API key via TIMEBANK_API_KEY
//!
//! Endpoints:
//! - GET  /health                            - Server status (exempt from auth)
//! - GET  /me                                - Caller's account
//! - POST /handshakes                        - Express interest in a service
//! - GET  /handshakes                        - Handshakes visible to the caller
//! - GET  /handshakes/{id}                   - One handshake
//! - GET  /handshakes/{id}/transitions       - Status history
//! - POST /handshakes/{id}/accept            - Owner accepts
//! - POST /handshakes/{id}/decline           - Owner declines
//! - POST /handshakes/{id}/cancel            - Requester withdraws
//! - POST /handshakes/{id}/confirm           - Party confirms completion
//! - POST /handshakes/{id}/report-no-show    - Party disputes
//! - GET|POST /handshakes/{id}/feedback      - Feedback after completion
//! - POST /reports                           - File a content report
//! - GET  /admin/reports                     - Reports by status
//! - POST /admin/reports/{id}/pause          - Pause a dispute
//! - POST /admin/reports/{id}/resolve        - Resolve a report
//! - POST /admin/users/{id}/warn|ban|unban   - Moderation
//! - POST /admin/users/{id}/karma|balance    - Adjustments
//! - POST /admin/accounts                    - Open an account
//! - GET  /admin/audit                       - Audit trail
//!
//! All responses use Content-Type: application/json. Errors are
//! `{"error": <message>, "code": <CODE>}`.

mod admin;
mod handlers;
mod middleware;
mod state;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware as axum_middleware, Json, Router};
use timebank_engine::{spawn_sweeper, Engine, EngineError, InMemoryCatalog, TracingSink};
use timebank_storage::MemoryStorage;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use self::admin::{
    handle_adjust_balance, handle_adjust_karma, handle_audit_log, handle_ban, handle_list_reports,
    handle_open_account, handle_pause_report, handle_resolve_report, handle_unban, handle_warn,
};
use self::handlers::{
    handle_accept, handle_cancel, handle_confirm, handle_decline, handle_express_interest,
    handle_file_report, handle_get_handshake, handle_health, handle_list_feedback,
    handle_list_handshakes, handle_me, handle_not_found, handle_report_no_show,
    handle_submit_feedback, handle_transitions,
};
use self::middleware::{auth_middleware, rate_limit_middleware};
use self::state::{AppState, RateLimiter};
use crate::config::Config;

/// Maximum request body size: 64 KB.
const MAX_BODY_SIZE: usize = 64 * 1024;

/// Default rate limit: 60 requests per minute per IP.
const DEFAULT_RATE_LIMIT: u64 = 60;

/// Rate limit window duration in seconds (1 minute).
const RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// Construct a JSON error response.
fn json_error(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(serde_json::json!({"error": message, "code": code})),
    )
        .into_response()
}

/// An engine error on its way to the client.
#[derive(Debug)]
pub(crate) struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    pub(crate) fn invalid_input(message: impl Into<String>) -> Self {
        ApiError(EngineError::InvalidInput(message.into()))
    }

    fn status(&self) -> StatusCode {
        match self.0 {
            EngineError::InvalidState(_)
            | EngineError::AlreadyExists(_)
            | EngineError::InsufficientBalance { .. }
            | EngineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            EngineError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            EngineError::Forbidden(_) => StatusCode::FORBIDDEN,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Conflict(_) => StatusCode::CONFLICT,
            EngineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        json_error(status, self.0.code(), &self.0.to_string())
    }
}

/// Build the engine for `config`: open storage, seed accounts, load the
/// service catalog.
pub(crate) async fn build_engine(
    config: &Config,
) -> Result<Engine<MemoryStorage>, Box<dyn std::error::Error>> {
    let storage = match &config.server.state_file {
        Some(path) => {
            tracing::info!(path = %path.display(), "using state file");
            MemoryStorage::open(path)?
        }
        None => MemoryStorage::new(),
    };
    let catalog = InMemoryCatalog::new(config.services.iter().cloned());
    tracing::info!(services = catalog.len(), "loaded service catalog");

    let engine = Engine::new(Arc::new(storage), Arc::new(catalog), config.policy.clone())
        .with_events(Arc::new(TracingSink));
    for seed in &config.accounts {
        if engine.seed_account(seed.to_record()).await? {
            tracing::info!(user_id = %seed.user_id, role = ?seed.role, "seeded account");
        }
    }
    Ok(engine)
}

/// Assemble the router with its middleware stack.
pub(crate) fn router(state: Arc<AppState>) -> Router {
    // CORS: permissive for local dev
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/me", get(handle_me))
        .route(
            "/handshakes",
            post(handle_express_interest).get(handle_list_handshakes),
        )
        .route("/handshakes/{id}", get(handle_get_handshake))
        .route("/handshakes/{id}/transitions", get(handle_transitions))
        .route("/handshakes/{id}/accept", post(handle_accept))
        .route("/handshakes/{id}/decline", post(handle_decline))
        .route("/handshakes/{id}/cancel", post(handle_cancel))
        .route("/handshakes/{id}/confirm", post(handle_confirm))
        .route("/handshakes/{id}/report-no-show", post(handle_report_no_show))
        .route(
            "/handshakes/{id}/feedback",
            post(handle_submit_feedback).get(handle_list_feedback),
        )
        .route("/reports", post(handle_file_report))
        .route("/admin/reports", get(handle_list_reports))
        .route("/admin/reports/{id}/pause", post(handle_pause_report))
        .route("/admin/reports/{id}/resolve", post(handle_resolve_report))
        .route("/admin/users/{id}/warn", post(handle_warn))
        .route("/admin/users/{id}/ban", post(handle_ban))
        .route("/admin/users/{id}/unban", post(handle_unban))
        .route("/admin/users/{id}/karma", post(handle_adjust_karma))
        .route("/admin/users/{id}/balance", post(handle_adjust_balance))
        .route("/admin/accounts", post(handle_open_account))
        .route("/admin/audit", get(handle_audit_log))
        .fallback(handle_not_found)
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}

/// Start the HTTP server on the given port.
///
/// Security:
/// - CORS: Permissive (`Any` origin) for local dev.
/// - Rate limit: Per-IP, `TIMEBANK_RATE_LIMIT` requests per minute (default 60).
/// - API key: If `TIMEBANK_API_KEY` is set, all endpoints except /health require it.
pub async fn start_server(config: Config, port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let engine = Arc::new(build_engine(&config).await?);

    let sweeper = config.policy.pending_expiry_secs.map(|secs| {
        tracing::info!(
            expiry_secs = secs,
            every_secs = config.server.sweep_interval_secs,
            "pending expiry sweep enabled"
        );
        spawn_sweeper(
            Arc::clone(&engine),
            Duration::from_secs(config.server.sweep_interval_secs),
        )
    });

    // Rate limit: from TIMEBANK_RATE_LIMIT env var, or default
    let rate_limit = std::env::var("TIMEBANK_RATE_LIMIT")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(DEFAULT_RATE_LIMIT);

    // API key: from TIMEBANK_API_KEY env var (None = no auth)
    let api_key = std::env::var("TIMEBANK_API_KEY")
        .ok()
        .filter(|k| !k.is_empty());

    if api_key.is_some() {
        tracing::info!("API key authentication enabled");
    }
    tracing::info!(rate_limit, "requests per minute per IP");

    let state = Arc::new(AppState {
        engine,
        rate_limiter: RateLimiter::new(rate_limit),
        api_key,
    });
    let app = router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("TimeBank listening on http://{}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    tracing::info!("server shut down");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C).
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
    tracing::info!("received shutdown signal");
}
