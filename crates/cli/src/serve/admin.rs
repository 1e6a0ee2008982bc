//! Admin route handlers. The engine enforces the admin role.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use rust_decimal::Decimal;
use serde::Deserialize;
use timebank_engine::{ReportStatus, ResolutionAction, Role};

use super::handlers::parse_body;
use super::middleware::Caller;
use super::state::AppState;
use super::ApiError;

type Shared = State<Arc<AppState>>;

#[derive(Deserialize)]
pub(crate) struct ReportParams {
    status: Option<String>,
}

/// GET /admin/reports
pub(crate) async fn handle_list_reports(
    State(state): Shared,
    Caller(actor): Caller,
    Query(params): Query<ReportParams>,
) -> Result<impl IntoResponse, ApiError> {
    let status = match params.status.as_deref() {
        Some(s) => Some(
            ReportStatus::parse(s)
                .ok_or_else(|| ApiError::invalid_input(format!("unknown report status '{s}'")))?,
        ),
        None => None,
    };
    let reports = state.engine.get_reports(&actor, status).await?;
    Ok(Json(serde_json::json!({ "reports": reports })))
}

/// POST /admin/reports/{id}/pause
pub(crate) async fn handle_pause_report(
    State(state): Shared,
    Caller(actor): Caller,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.pause_report(&actor, &id).await?))
}

#[derive(Deserialize)]
struct ResolveBody {
    action: ResolutionAction,
    #[serde(default)]
    notes: Option<String>,
}

/// POST /admin/reports/{id}/resolve
pub(crate) async fn handle_resolve_report(
    State(state): Shared,
    Caller(actor): Caller,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let body: ResolveBody = parse_body(&body)?;
    let report = state
        .engine
        .resolve_report(&actor, &id, body.action, body.notes)
        .await?;
    Ok(Json(report))
}

#[derive(Deserialize)]
struct WarnBody {
    message: String,
}

/// POST /admin/users/{id}/warn
pub(crate) async fn handle_warn(
    State(state): Shared,
    Caller(actor): Caller,
    Path(user_id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let body: WarnBody = parse_body(&body)?;
    let warning = state
        .engine
        .warn_user(&actor, &user_id, &body.message)
        .await?;
    Ok((StatusCode::CREATED, Json(warning)))
}

/// POST /admin/users/{id}/ban
pub(crate) async fn handle_ban(
    State(state): Shared,
    Caller(actor): Caller,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.ban_user(&actor, &user_id).await?))
}

/// POST /admin/users/{id}/unban
pub(crate) async fn handle_unban(
    State(state): Shared,
    Caller(actor): Caller,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.unban_user(&actor, &user_id).await?))
}

#[derive(Deserialize)]
struct KarmaBody {
    delta: i64,
}

/// POST /admin/users/{id}/karma
pub(crate) async fn handle_adjust_karma(
    State(state): Shared,
    Caller(actor): Caller,
    Path(user_id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let body: KarmaBody = parse_body(&body)?;
    let karma = state
        .engine
        .adjust_karma(&actor, &user_id, body.delta)
        .await?;
    Ok(Json(serde_json::json!({
        "user_id": user_id,
        "new_karma": karma,
    })))
}

#[derive(Deserialize)]
struct BalanceBody {
    delta: Decimal,
}

/// POST /admin/users/{id}/balance
pub(crate) async fn handle_adjust_balance(
    State(state): Shared,
    Caller(actor): Caller,
    Path(user_id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let body: BalanceBody = parse_body(&body)?;
    let balance = state
        .engine
        .adjust_balance(&actor, &user_id, body.delta)
        .await?;
    Ok(Json(serde_json::json!({
        "user_id": user_id,
        "new_balance": balance,
    })))
}

#[derive(Deserialize)]
struct OpenAccountBody {
    user_id: String,
    #[serde(default = "member")]
    role: Role,
    #[serde(default)]
    balance: Decimal,
}

fn member() -> Role {
    Role::Member
}

/// POST /admin/accounts
pub(crate) async fn handle_open_account(
    State(state): Shared,
    Caller(actor): Caller,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let body: OpenAccountBody = parse_body(&body)?;
    let account = state
        .engine
        .open_account(&actor, &body.user_id, body.role, body.balance)
        .await?;
    Ok((StatusCode::CREATED, Json(account)))
}

#[derive(Deserialize)]
pub(crate) struct AuditParams {
    subject: Option<String>,
}

/// GET /admin/audit
pub(crate) async fn handle_audit_log(
    State(state): Shared,
    Caller(actor): Caller,
    Query(params): Query<AuditParams>,
) -> Result<impl IntoResponse, ApiError> {
    let entries = state
        .engine
        .audit_log(&actor, params.subject.as_deref())
        .await?;
    Ok(Json(serde_json::json!({ "audit": entries })))
}
