//! REST API handlers for worker membership and status reports.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use sourcegrid_cluster::{HeartbeatRequest, JoinRequest};
use sourcegrid_orchestrator::InstanceReport;
use sourcegrid_state::WorkerNode;

use crate::ApiState;
use crate::handlers::{ApiResponse, error_response, status_for};

#[derive(Debug, Serialize)]
pub struct JoinResponse {
    pub node: WorkerNode,
    pub heartbeat_interval_secs: u32,
}

#[derive(Debug, Serialize)]
pub struct ReportAck {
    pub received: usize,
    pub applied: usize,
}

fn bad_body(rejection: JsonRejection) -> Response {
    error_response(&rejection.body_text(), StatusCode::BAD_REQUEST)
}

/// GET /admin/v3/workers
pub async fn list_workers(State(state): State<ApiState>) -> Response {
    match state.membership.list_members() {
        Ok(members) => ApiResponse::ok(members).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// POST /admin/v3/workers
pub async fn join(
    State(state): State<ApiState>,
    request: Result<Json<JoinRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match request {
        Ok(request) => request,
        Err(rejection) => return bad_body(rejection),
    };
    if request.address.trim().is_empty() || request.port == 0 {
        return error_response("address and port are required", StatusCode::BAD_REQUEST);
    }
    match state.membership.join(request) {
        Ok(node) => (
            StatusCode::CREATED,
            ApiResponse::ok(JoinResponse {
                node,
                heartbeat_interval_secs: state.membership.heartbeat_interval_secs(),
            }),
        )
            .into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// POST /admin/v3/workers/{id}/heartbeat
pub async fn heartbeat(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    request: Result<Json<HeartbeatRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match request {
        Ok(request) => request,
        Err(rejection) => return bad_body(rejection),
    };
    match state.membership.heartbeat(&id, &request) {
        Ok(true) => ApiResponse::ok(id).into_response(),
        Ok(false) => error_response("unknown worker; join again", StatusCode::NOT_FOUND),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// DELETE /admin/v3/workers/{id}
pub async fn leave(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.membership.leave(&id) {
        Ok(true) => ApiResponse::ok(id).into_response(),
        Ok(false) => error_response("worker not found", StatusCode::NOT_FOUND),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// POST /admin/v3/workers/{id}/reports
pub async fn reports(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    reports: Result<Json<Vec<InstanceReport>>, JsonRejection>,
) -> Response {
    let Json(reports) = match reports {
        Ok(reports) => reports,
        Err(rejection) => return bad_body(rejection),
    };
    match state.membership.get_member(&id) {
        Ok(Some(_)) => {}
        Ok(None) => return error_response("unknown worker; join again", StatusCode::NOT_FOUND),
        Err(e) => return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
    match state.orchestrator.observe(&id, &reports).await {
        Ok(applied) => ApiResponse::ok(ReportAck {
            received: reports.len(),
            applied,
        })
        .into_response(),
        Err(e) => error_response(&e.to_string(), status_for(&e)),
    }
}
