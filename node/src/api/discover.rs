//! `POST /api/v1/discover` (spec §6): lists the VMs a Node's vCenter
//! reports, optionally filtered by name.

use super::AppState;
use crate::error::ApiError;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use common::wire::{DiscoverRequest, DiscoverResponse};

pub fn routes() -> Router<AppState> {
    Router::new().route("/api/v1/discover", post(discover))
}

async fn discover(State(state): State<AppState>, Json(req): Json<DiscoverRequest>) -> Result<Json<DiscoverResponse>, ApiError> {
    let vms = state.vcenter.discover(&req.credential, req.filter.as_deref()).await?;
    Ok(Json(DiscoverResponse { vms }))
}
