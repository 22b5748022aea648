//! Replication job control surface: `/api/v1/replication/*`, including the
//! progress-bus subscription the CLI polls against instead of opening a
//! websocket (spec §4.T3's "no durability, fan-out only" progress bus).

use super::AppState;
use crate::error::ApiError;
use crate::store::jobs;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use common::{ProgressUpdate, ReplicationJob};
use serde::{Deserialize, Serialize};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/replication/jobs", post(start))
        .route("/api/v1/replication/jobs/:job_id", get(get_job))
        .route("/api/v1/replication/jobs/:job_id/progress", get(get_progress))
        .route("/api/v1/replication/jobs/:job_id/cancel", post(cancel))
}

#[derive(Deserialize)]
struct StartReplicationRequest {
    context_id: String,
}

#[derive(Serialize)]
struct JobIdResponse {
    job_id: String,
}

async fn start(State(state): State<AppState>, Json(req): Json<StartReplicationRequest>) -> Result<Json<JobIdResponse>, ApiError> {
    let job_id = state.orchestrator.start_replication(&req.context_id).await?;
    Ok(Json(JobIdResponse { job_id }))
}

async fn get_job(State(state): State<AppState>, Path(job_id): Path<String>) -> Result<Json<ReplicationJob>, ApiError> {
    Ok(Json(jobs::get(state.db.pool(), &job_id).await?))
}

async fn get_progress(State(state): State<AppState>, Path(job_id): Path<String>) -> Result<Json<Option<ProgressUpdate>>, ApiError> {
    Ok(Json(state.progress.last(&job_id).await))
}

async fn cancel(State(state): State<AppState>, Path(job_id): Path<String>) -> Result<Json<serde_json::Value>, ApiError> {
    state.orchestrator.cancel(&job_id).await?;
    Ok(Json(serde_json::json!({"status": "cancel_requested"})))
}
