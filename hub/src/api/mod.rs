//! The axum HTTP surface: the Hub-half enrolment API the Node calls through
//! the tunnel, plus the thin slice of the management API the CLI and test
//! scenarios need to drive groups, schedules, and failover/rollback (spec
//! §6 — the full management API is explicitly out of core scope).

mod enroll;
mod failover;
mod management;
mod replication;
mod restore;

use crate::config::HubConfig;
use crate::enrollment::EnrollmentManager;
use crate::failover::FailoverEngine;
use crate::mount::MountManager;
use crate::orchestrator::ReplicationOrchestrator;
use crate::progress::ProgressBus;
use crate::store::Database;
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tower::timeout::TimeoutLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub config: Arc<HubConfig>,
    pub enrollment: Arc<EnrollmentManager>,
    pub orchestrator: Arc<ReplicationOrchestrator>,
    pub failover: Arc<FailoverEngine>,
    pub mounts: Arc<MountManager>,
    pub progress: Arc<ProgressBus>,
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(enroll::routes())
        .merge(management::routes())
        .merge(failover::routes())
        .merge(replication::routes())
        .merge(restore::routes())
        .route("/api/v1/health", axum::routing::get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(state)
}

async fn health(axum::extract::State(state): axum::extract::State<AppState>) -> Result<axum::Json<serde_json::Value>, crate::error::ApiError> {
    state.db.health_check().await?;
    Ok(axum::Json(serde_json::json!({"status": "ok"})))
}
