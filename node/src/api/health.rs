//! `GET /api/v1/health` (spec §6): reports the tunnel's current state so the
//! Hub can distinguish "node unreachable" from "node reachable but tunnel
//! degraded".

use super::AppState;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use common::wire::HealthResponse;

pub fn routes() -> Router<AppState> {
    Router::new().route("/api/v1/health", get(health))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let tunnel_state = state.tunnel_state.borrow().as_str().to_string();
    Json(HealthResponse { status: "ok".to_string(), tunnel_state })
}
