//! Failover/rollback control surface: `/api/v1/failover/*` (spec §6 thin
//! management-API slice).

use super::AppState;
use crate::error::ApiError;
use crate::store::failover as store;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use common::{FailoverJob, FailoverMode, FailoverPhaseProgress, RollbackOptions};
use serde::{Deserialize, Serialize};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/failover/unified", post(start_failover))
        .route("/api/v1/failover/rollback", post(start_rollback))
        .route("/api/v1/failover/:failover_id", get(get_failover))
        .route("/api/v1/failover/progress/:failover_id", get(get_progress))
}

#[derive(Deserialize)]
struct StartFailoverRequest {
    context_id: String,
    mode: FailoverMode,
    reason: Option<String>,
}

#[derive(Serialize)]
struct FailoverIdResponse {
    failover_id: String,
}

async fn start_failover(State(state): State<AppState>, Json(req): Json<StartFailoverRequest>) -> Result<Json<FailoverIdResponse>, ApiError> {
    let failover_id = state.failover.start_failover(&req.context_id, req.mode, req.reason).await?;
    Ok(Json(FailoverIdResponse { failover_id }))
}

#[derive(Deserialize)]
struct StartRollbackRequest {
    failover_id: String,
    #[serde(default)]
    options: RollbackOptions,
    reason: Option<String>,
}

async fn start_rollback(State(state): State<AppState>, Json(req): Json<StartRollbackRequest>) -> Result<Json<FailoverIdResponse>, ApiError> {
    let failover_id = state.failover.start_rollback(&req.failover_id, req.options, req.reason).await?;
    Ok(Json(FailoverIdResponse { failover_id }))
}

async fn get_failover(State(state): State<AppState>, Path(failover_id): Path<String>) -> Result<Json<FailoverJob>, ApiError> {
    Ok(Json(state.failover.get_status(&failover_id).await?))
}

#[derive(Serialize)]
struct FailoverProgressResponse {
    job: FailoverJob,
    completed_phases: Vec<FailoverPhaseProgress>,
}

async fn get_progress(State(state): State<AppState>, Path(failover_id): Path<String>) -> Result<Json<FailoverProgressResponse>, ApiError> {
    let job = state.failover.get_status(&failover_id).await?;
    let completed_phases = store::list_phase_progress(state.db.pool(), &failover_id).await?;
    Ok(Json(FailoverProgressResponse { job, completed_phases }))
}
