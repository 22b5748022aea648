//! Operator-facing slice of the management API: pairing-code issuance,
//! enrolment approval/rejection, ungrouped-VM discovery, and
//! machine-group/schedule administration — exactly what `opctl` and the
//! test scenarios need to drive the system (spec §6: the full management
//! API is out of core scope, this is the thin slice that isn't).

use super::AppState;
use crate::error::ApiError;
use crate::store::{contexts, scheduling};
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use common::{PairingCode, ReplicationSchedule, VmContext, VmGroupMembership, VmMachineGroup};
use serde::Deserialize;
use std::path::Path as FsPath;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/pairing-codes", post(issue_pairing_code))
        .route("/api/v1/enrollments/:enrollment_id/approve", post(approve_enrollment))
        .route("/api/v1/enrollments/:enrollment_id/reject", post(reject_enrollment))
        .route("/api/v1/discovery/ungrouped-vms", get(ungrouped_vms))
        .route("/api/v1/machine-groups", post(create_group))
        .route("/api/v1/machine-groups", get(list_groups))
        .route("/api/v1/machine-groups/:group_id/members", post(add_member))
        .route("/api/v1/schedules", post(create_schedule))
        .route("/api/v1/schedules", get(list_schedules))
}

async fn issue_pairing_code(State(state): State<AppState>) -> Result<Json<PairingCode>, ApiError> {
    Ok(Json(state.enrollment.issue_pairing_code().await?))
}

async fn approve_enrollment(State(state): State<AppState>, Path(enrollment_id): Path<String>) -> Result<Json<serde_json::Value>, ApiError> {
    let path = FsPath::new(&state.config.tunnel.authorized_keys_path);
    state.enrollment.approve(&enrollment_id, path).await?;
    Ok(Json(serde_json::json!({"status": "approved"})))
}

async fn reject_enrollment(State(state): State<AppState>, Path(enrollment_id): Path<String>) -> Result<Json<serde_json::Value>, ApiError> {
    state.enrollment.reject(&enrollment_id).await?;
    Ok(Json(serde_json::json!({"status": "rejected"})))
}

async fn ungrouped_vms(State(state): State<AppState>) -> Result<Json<Vec<VmContext>>, ApiError> {
    Ok(Json(contexts::list_ungrouped(state.db.pool()).await?))
}

#[derive(Deserialize)]
struct CreateGroupRequest {
    name: String,
    max_concurrent_vms: u32,
    created_by: String,
    schedule_id: Option<String>,
}

async fn create_group(State(state): State<AppState>, Json(req): Json<CreateGroupRequest>) -> Result<Json<VmMachineGroup>, ApiError> {
    let mut group = VmMachineGroup::new(req.name, req.max_concurrent_vms, req.created_by);
    group.schedule_id = req.schedule_id;
    scheduling::create_group(state.db.pool(), &group).await?;
    Ok(Json(group))
}

async fn list_groups(State(state): State<AppState>) -> Result<Json<Vec<VmMachineGroup>>, ApiError> {
    Ok(Json(scheduling::list_groups(state.db.pool()).await?))
}

#[derive(Deserialize)]
struct AddMemberRequest {
    context_id: String,
    priority: Option<i32>,
}

async fn add_member(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Json(req): Json<AddMemberRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let membership = VmGroupMembership {
        group_id,
        context_id: req.context_id,
        priority: req.priority.unwrap_or(0),
        enabled: true,
        added_at: chrono::Utc::now(),
    };
    scheduling::add_membership(state.db.pool(), &membership).await?;
    Ok(Json(serde_json::json!({"status": "added"})))
}

#[derive(Deserialize)]
struct CreateScheduleRequest {
    name: String,
    cron_expression: String,
}

async fn create_schedule(State(state): State<AppState>, Json(req): Json<CreateScheduleRequest>) -> Result<Json<ReplicationSchedule>, ApiError> {
    let schedule = ReplicationSchedule::new(req.name, req.cron_expression);
    scheduling::create_schedule(state.db.pool(), &schedule).await?;
    Ok(Json(schedule))
}

async fn list_schedules(State(state): State<AppState>) -> Result<Json<Vec<ReplicationSchedule>>, ApiError> {
    Ok(Json(scheduling::list_enabled_schedules(state.db.pool()).await?))
}
