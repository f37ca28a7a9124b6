//! REST API handlers.
//!
//! Each handler delegates to the orchestrator and returns JSON responses.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;

use switchyard_pipeline::PipelineError;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn pipeline_error(e: &PipelineError) -> StatusCode {
    match e {
        PipelineError::UnknownService(_)
        | PipelineError::NoActiveRun(_)
        | PipelineError::NoPendingApproval(_) => StatusCode::NOT_FOUND,
        PipelineError::RunInProgress(_)
        | PipelineError::CancelTooLate(_)
        | PipelineError::ApprovalAlreadyDecided(_) => StatusCode::CONFLICT,
        PipelineError::State(_) | PipelineError::Cutover(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ── Services ───────────────────────────────────────────────────

/// GET /api/v1/services
pub async fn list_services(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.orchestrator.services())
}

/// GET /api/v1/services/:service/routing
pub async fn get_routing(
    State(state): State<ApiState>,
    Path(service): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.routing(&service) {
        Ok(routing) => ApiResponse::ok(routing).into_response(),
        Err(e) => error_response(&e.to_string(), pipeline_error(&e)).into_response(),
    }
}

// ── Runs ───────────────────────────────────────────────────────

/// Trigger request body.
#[derive(serde::Deserialize)]
pub struct TriggerRequest {
    pub source_revision: String,
}

/// POST /api/v1/services/:service/runs
pub async fn trigger_run(
    State(state): State<ApiState>,
    Path(service): Path<String>,
    Json(req): Json<TriggerRequest>,
) -> impl IntoResponse {
    match state.orchestrator.trigger(&service, &req.source_revision) {
        Ok(run_id) => (
            StatusCode::ACCEPTED,
            ApiResponse::ok(serde_json::json!({
                "run_id": run_id,
                "service": service,
                "revision": req.source_revision,
            })),
        )
            .into_response(),
        Err(e) => error_response(&e.to_string(), pipeline_error(&e)).into_response(),
    }
}

/// GET /api/v1/runs
pub async fn list_runs(State(state): State<ApiState>) -> impl IntoResponse {
    match state.orchestrator.runs() {
        Ok(runs) => ApiResponse::ok(runs).into_response(),
        Err(e) => error_response(&e.to_string(), pipeline_error(&e)).into_response(),
    }
}

/// GET /api/v1/runs/:id
pub async fn get_run(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.run(&id) {
        Ok(Some(run)) => ApiResponse::ok(run).into_response(),
        Ok(None) => error_response("run not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => error_response(&e.to_string(), pipeline_error(&e)).into_response(),
    }
}

// ── Approvals ──────────────────────────────────────────────────

/// Decision request body. The identity is recorded with the decision.
#[derive(serde::Deserialize)]
pub struct DecisionRequest {
    #[serde(default = "default_decided_by")]
    pub decided_by: String,
}

fn default_decided_by() -> String {
    "api".to_string()
}

/// POST /api/v1/runs/:id/approve
pub async fn approve_run(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<DecisionRequest>,
) -> impl IntoResponse {
    match state.orchestrator.approve(&id, &req.decided_by) {
        Ok(()) => ApiResponse::ok("approved").into_response(),
        Err(e) => error_response(&e.to_string(), pipeline_error(&e)).into_response(),
    }
}

/// POST /api/v1/runs/:id/reject
pub async fn reject_run(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<DecisionRequest>,
) -> impl IntoResponse {
    match state.orchestrator.reject(&id, &req.decided_by) {
        Ok(()) => ApiResponse::ok("rejected").into_response(),
        Err(e) => error_response(&e.to_string(), pipeline_error(&e)).into_response(),
    }
}

// ── Cancellation ───────────────────────────────────────────────

/// POST /api/v1/runs/:id/cancel
pub async fn cancel_run(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.cancel(&id) {
        Ok(()) => ApiResponse::ok("cancellation requested").into_response(),
        Err(e) => error_response(&e.to_string(), pipeline_error(&e)).into_response(),
    }
}
