//! `PUT /api/v1/config` (spec §6): the Hub pushes the NBD export this Node
//! should serve once the data-mover's target device is ready.

use super::AppState;
use crate::error::ApiError;
use axum::extract::State;
use axum::routing::put;
use axum::{Json, Router};
use common::wire::NodeConfigUpdate;

pub fn routes() -> Router<AppState> {
    Router::new().route("/api/v1/config", put(update_config))
}

async fn update_config(State(state): State<AppState>, Json(req): Json<NodeConfigUpdate>) -> Result<Json<serde_json::Value>, ApiError> {
    // Out of core scope per spec §1 (no real NBD export plumbing here): the
    // endpoint validates and acknowledges the push so the Hub's side of the
    // handshake has somewhere to land.
    state.nbd_export.write().await.replace(req);
    Ok(Json(serde_json::json!({"status": "ok"})))
}
