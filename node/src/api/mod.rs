//! The Node's control API (spec §6): every route the Hub reaches through
//! the tunnel's remote forward, plus the local-only enrolment endpoints an
//! operator drives directly on the Node.

mod config;
mod discover;
mod enrollment;
mod health;
mod replicate;
mod vm;

use crate::config::NodeConfig;
use crate::enrollment::{EnrollmentClient, NodeKeypair};
use crate::replication::ReplicateManager;
use crate::tunnel::TunnelState;
use crate::vcenter::VCenterAdapter;
use axum::Router;
use common::wire::NodeConfigUpdate;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tower::timeout::TimeoutLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Default)]
pub struct LocalEnrollmentState {
    pub status: String,
    pub enrollment_id: Option<String>,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<NodeConfig>,
    pub vcenter: Arc<dyn VCenterAdapter>,
    pub replication: Arc<ReplicateManager>,
    pub tunnel_state: watch::Receiver<TunnelState>,
    pub enrollment_client: Arc<EnrollmentClient>,
    pub keypair: Arc<NodeKeypair>,
    pub local_enrollment: Arc<RwLock<LocalEnrollmentState>>,
    pub nbd_export: Arc<RwLock<Option<NodeConfigUpdate>>>,
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(discover::routes())
        .merge(replicate::routes())
        .merge(vm::routes())
        .merge(config::routes())
        .merge(health::routes())
        .merge(enrollment::routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(state)
}
