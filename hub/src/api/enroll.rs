//! Node-facing enrolment endpoints under `/api/v1/vma/enroll*` (spec §4.L2,
//! §6). The node calls these directly over the tunnel's remote forward
//! before any other control-plane traffic is trusted.

use super::AppState;
use crate::error::ApiError;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use common::wire::{EnrollRequest, EnrollResponse, EnrollResultResponse, EnrollVerifyRequest};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/vma/enroll", post(begin))
        .route("/api/v1/vma/enroll/verify", post(verify))
        .route("/api/v1/vma/enroll/result/:enrollment_id", get(result))
}

async fn begin(State(state): State<AppState>, Json(req): Json<EnrollRequest>) -> Result<Json<EnrollResponse>, ApiError> {
    let enrollment = state
        .enrollment
        .begin_enrollment(&req.pairing_code, &req.node_public_key, &req.node_name, &req.node_version, &req.key_fingerprint)
        .await?;
    Ok(Json(EnrollResponse { enrollment_id: enrollment.enrollment_id, challenge: enrollment.challenge }))
}

async fn verify(State(state): State<AppState>, Json(req): Json<EnrollVerifyRequest>) -> Result<Json<EnrollResultResponse>, ApiError> {
    let status = state.enrollment.verify_enrollment(&req.enrollment_id, &req.signature).await?;
    Ok(Json(EnrollResultResponse { status: status_str(status).to_string() }))
}

async fn result(State(state): State<AppState>, Path(enrollment_id): Path<String>) -> Result<Json<EnrollResultResponse>, ApiError> {
    let status = state.enrollment.status(&enrollment_id).await?;
    Ok(Json(EnrollResultResponse { status: status_str(status).to_string() }))
}

fn status_str(status: common::EnrollmentStatus) -> &'static str {
    use common::EnrollmentStatus::*;
    match status {
        PendingVerification => "pending_verification",
        AwaitingApproval => "awaiting_approval",
        Approved => "approved",
        Rejected => "rejected",
        Expired => "expired",
    }
}
