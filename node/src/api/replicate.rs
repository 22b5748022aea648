//! `POST /api/v1/replicate`, `POST /api/v1/cleanup`, `GET /api/v1/status/:job_id`
//! and `GET /api/v1/progress/:job_id` (spec §6): the job-control slice of the
//! Node's control API, backed by `ReplicateManager`.

use super::AppState;
use crate::error::ApiError;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use common::wire::{CleanupRequest, JobStatusResponse, ProgressResponse, ReplicateRequest, ReplicateResponse};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/replicate", post(replicate))
        .route("/api/v1/cleanup", post(cleanup))
        .route("/api/v1/status/:job_id", get(status))
        .route("/api/v1/progress/:job_id", get(progress))
}

async fn replicate(State(state): State<AppState>, Json(req): Json<ReplicateRequest>) -> Result<Json<ReplicateResponse>, ApiError> {
    Ok(Json(state.replication.start(req).await?))
}

async fn cleanup(State(state): State<AppState>, Json(req): Json<CleanupRequest>) -> Result<Json<serde_json::Value>, ApiError> {
    state.replication.cleanup(req).await?;
    Ok(Json(serde_json::json!({"status": "ok"})))
}

async fn status(State(state): State<AppState>, Path(job_id): Path<String>) -> Result<Json<JobStatusResponse>, ApiError> {
    Ok(Json(state.replication.status(&job_id).await?))
}

async fn progress(State(state): State<AppState>, Path(job_id): Path<String>) -> Result<Json<ProgressResponse>, ApiError> {
    Ok(Json(state.replication.progress(&job_id).await?))
}
