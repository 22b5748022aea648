//! `POST /api/v1/enrollment/enroll`, `GET /api/v1/enrollment/status` (spec
//! §6): local administrative endpoints an operator reaches directly on the
//! Node (before the tunnel exists, there's nothing on the Hub side to talk
//! to yet) to kick off and watch the enrolment handshake described in
//! `crate::enrollment`.

use super::AppState;
use crate::error::ApiError;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/enrollment/enroll", post(start_enrollment))
        .route("/api/v1/enrollment/status", get(enrollment_status))
}

#[derive(Deserialize)]
struct StartEnrollmentRequest {
    pairing_code: String,
}

#[derive(Serialize)]
struct EnrollmentStatusResponse {
    status: String,
    enrollment_id: Option<String>,
}

async fn start_enrollment(State(state): State<AppState>, Json(req): Json<StartEnrollmentRequest>) -> Result<Json<serde_json::Value>, ApiError> {
    {
        let mut local = state.local_enrollment.write().await;
        local.status = "enrolling".to_string();
        local.enrollment_id = None;
    }

    let state = state.clone();
    tokio::spawn(async move {
        let node_name = state.config.server.node_name.clone();
        let result = state
            .enrollment_client
            .enroll(&req.pairing_code, &state.keypair, &node_name, env!("CARGO_PKG_VERSION"), Duration::from_secs(5), Duration::from_secs(600))
            .await;
        let mut local = state.local_enrollment.write().await;
        match result {
            Ok(enrollment_id) => {
                local.status = "approved".to_string();
                local.enrollment_id = Some(enrollment_id);
            }
            Err(e) => {
                warn!(error = %e, "enrolment did not complete");
                local.status = "failed".to_string();
            }
        }
    });

    Ok(Json(serde_json::json!({"status": "enrolling"})))
}

async fn enrollment_status(State(state): State<AppState>) -> Json<EnrollmentStatusResponse> {
    let local = state.local_enrollment.read().await;
    Json(EnrollmentStatusResponse { status: local.status.clone(), enrollment_id: local.enrollment_id.clone() })
}
