//! Member-facing route handlers.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use timebank_engine::{
    FeedbackInput, HandshakeFilter, HandshakeStatus, NewReport, ReportType,
};

use super::middleware::Caller;
use super::state::AppState;
use super::{json_error, ApiError};

type Shared = State<Arc<AppState>>;

/// Decode a JSON request body. An empty body reads as `{}`.
pub(crate) fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    let raw: &[u8] = if body.iter().all(u8::is_ascii_whitespace) {
        b"{}"
    } else {
        body
    };
    serde_json::from_slice(raw)
        .map_err(|e| ApiError::invalid_input(format!("invalid request body: {e}")))
}

/// Fallback handler for unmatched routes.
pub(crate) async fn handle_not_found() -> impl IntoResponse {
    json_error(StatusCode::NOT_FOUND, "NOT_FOUND", "not found")
}

/// GET /health
pub(crate) async fn handle_health() -> impl IntoResponse {
    let response = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    });
    (StatusCode::OK, Json(response))
}

/// GET /me
pub(crate) async fn handle_me(
    State(state): Shared,
    Caller(actor): Caller,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.account(&actor).await?))
}

// ── Handshakes ───────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ExpressInterestBody {
    service_id: String,
    #[serde(default)]
    scheduled_time: Option<String>,
}

/// POST /handshakes
pub(crate) async fn handle_express_interest(
    State(state): Shared,
    Caller(actor): Caller,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let body: ExpressInterestBody = parse_body(&body)?;
    let handshake = state
        .engine
        .express_interest(&actor, &body.service_id, body.scheduled_time)
        .await?;
    Ok((StatusCode::CREATED, Json(handshake)))
}

#[derive(Deserialize)]
pub(crate) struct ListParams {
    status: Option<String>,
    service_id: Option<String>,
    #[serde(default)]
    limit: usize,
}

/// GET /handshakes
pub(crate) async fn handle_list_handshakes(
    State(state): Shared,
    Caller(actor): Caller,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let status = match params.status.as_deref() {
        Some(s) => Some(
            HandshakeStatus::parse(s)
                .ok_or_else(|| ApiError::invalid_input(format!("unknown status '{s}'")))?,
        ),
        None => None,
    };
    let filter = HandshakeFilter {
        status,
        service_id: params.service_id,
        limit: params.limit,
    };
    let handshakes = state.engine.list_handshakes(&actor, filter).await?;
    Ok(Json(serde_json::json!({ "handshakes": handshakes })))
}

/// GET /handshakes/{id}
pub(crate) async fn handle_get_handshake(
    State(state): Shared,
    Caller(actor): Caller,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.get_handshake(&actor, &id).await?))
}

/// GET /handshakes/{id}/transitions
pub(crate) async fn handle_transitions(
    State(state): Shared,
    Caller(actor): Caller,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let transitions = state.engine.transitions(&actor, &id).await?;
    Ok(Json(serde_json::json!({ "transitions": transitions })))
}

#[derive(Deserialize)]
struct AcceptBody {
    #[serde(default)]
    scheduled_time: Option<String>,
}

/// POST /handshakes/{id}/accept
pub(crate) async fn handle_accept(
    State(state): Shared,
    Caller(actor): Caller,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let body: AcceptBody = parse_body(&body)?;
    Ok(Json(
        state.engine.accept(&actor, &id, body.scheduled_time).await?,
    ))
}

/// POST /handshakes/{id}/decline
pub(crate) async fn handle_decline(
    State(state): Shared,
    Caller(actor): Caller,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.decline(&actor, &id).await?))
}

/// POST /handshakes/{id}/cancel
pub(crate) async fn handle_cancel(
    State(state): Shared,
    Caller(actor): Caller,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.cancel(&actor, &id).await?))
}

#[derive(Deserialize)]
struct ConfirmBody {
    #[serde(default)]
    hours: Option<Decimal>,
}

/// POST /handshakes/{id}/confirm
pub(crate) async fn handle_confirm(
    State(state): Shared,
    Caller(actor): Caller,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let body: ConfirmBody = parse_body(&body)?;
    Ok(Json(
        state
            .engine
            .confirm_complete(&actor, &id, body.hours)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
struct NoShowBody {
    reason: String,
}

/// POST /handshakes/{id}/report-no-show
pub(crate) async fn handle_report_no_show(
    State(state): Shared,
    Caller(actor): Caller,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let body: NoShowBody = parse_body(&body)?;
    let report = state
        .engine
        .report_no_show(&actor, &id, &body.reason)
        .await?;
    Ok((StatusCode::CREATED, Json(report)))
}

/// POST /handshakes/{id}/feedback
pub(crate) async fn handle_submit_feedback(
    State(state): Shared,
    Caller(actor): Caller,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let input: FeedbackInput = parse_body(&body)?;
    let feedback = state.engine.submit_feedback(&actor, &id, input).await?;
    Ok((StatusCode::CREATED, Json(feedback)))
}

/// GET /handshakes/{id}/feedback
pub(crate) async fn handle_list_feedback(
    State(state): Shared,
    Caller(actor): Caller,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let feedback = state.engine.feedback_for(&actor, &id).await?;
    Ok(Json(serde_json::json!({ "feedback": feedback })))
}

// ── Reports ──────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct FileReportBody {
    report_type: ReportType,
    #[serde(default)]
    reported_user_id: Option<String>,
    #[serde(default)]
    reported_service_id: Option<String>,
    #[serde(default)]
    description: String,
}

/// POST /reports
pub(crate) async fn handle_file_report(
    State(state): Shared,
    Caller(actor): Caller,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let body: FileReportBody = parse_body(&body)?;
    if body.report_type == ReportType::NoShow {
        return Err(ApiError::invalid_input(
            "no-show reports are filed against a handshake",
        ));
    }
    let report = state
        .engine
        .file_report(
            &actor,
            NewReport {
                report_type: body.report_type,
                reported_user_id: body.reported_user_id,
                reported_service_id: body.reported_service_id,
                description: body.description,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(report)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_body_reads_as_empty_object() {
        let body: AcceptBody = parse_body(&Bytes::from_static(b"  ")).unwrap();
        assert!(body.scheduled_time.is_none());
    }

    #[test]
    fn malformed_body_is_invalid_input() {
        let err = parse_body::<NoShowBody>(&Bytes::from_static(b"{")).unwrap_err();
        assert_eq!(err.0.code(), "INVALID_INPUT");
        let err = parse_body::<NoShowBody>(&Bytes::new()).unwrap_err();
        assert_eq!(err.0.code(), "INVALID_INPUT");
    }

    #[test]
    fn confirm_hours_accept_strings_and_numbers() {
        let body: ConfirmBody = parse_body(&Bytes::from_static(br#"{"hours":"2"}"#)).unwrap();
        assert_eq!(body.hours, Some(Decimal::from(2)));
        let body: ConfirmBody = parse_body(&Bytes::from_static(br#"{"hours":2}"#)).unwrap();
        assert_eq!(body.hours, Some(Decimal::from(2)));
    }
}
