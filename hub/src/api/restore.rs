//! Restore-mount control surface: `/api/v1/restores/*` (spec §4.T2).

use super::AppState;
use crate::error::ApiError;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use common::{RestoreMount, RestoreMountMode};
use serde::Deserialize;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/restores", post(mount))
        .route("/api/v1/restores", get(list_active))
        .route("/api/v1/restores/:mount_id", get(get_mount))
        .route("/api/v1/restores/:mount_id/unmount", post(unmount))
}

#[derive(Deserialize)]
struct MountRequest {
    backup_id: String,
    mount_path: String,
    filesystem_type: String,
    #[serde(default)]
    mode: RestoreMountMode,
    ttl_seconds: Option<i64>,
}

async fn mount(State(state): State<AppState>, Json(req): Json<MountRequest>) -> Result<Json<RestoreMount>, ApiError> {
    let mount = state.mounts.mount(&req.backup_id, &req.mount_path, &req.filesystem_type, req.mode, req.ttl_seconds).await?;
    Ok(Json(mount))
}

async fn list_active(State(state): State<AppState>) -> Result<Json<Vec<RestoreMount>>, ApiError> {
    Ok(Json(state.mounts.list_active().await?))
}

async fn get_mount(State(state): State<AppState>, Path(mount_id): Path<String>) -> Result<Json<RestoreMount>, ApiError> {
    Ok(Json(state.mounts.get(&mount_id).await?))
}

async fn unmount(State(state): State<AppState>, Path(mount_id): Path<String>) -> Result<Json<serde_json::Value>, ApiError> {
    state.mounts.unmount(&mount_id).await?;
    Ok(Json(serde_json::json!({"status": "unmounted"})))
}
