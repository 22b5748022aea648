//! `GET /api/v1/vms/{vm_path}/cbt-status`, `POST /api/v1/vm-spec-changes`,
//! and the power-control trio (spec §6, §4.L3). Power ops and the spec-diff
//! probe act on a VM the Hub isn't actively replicating, so they fall back
//! to the Node's configured default vCenter credential rather than taking
//! one in the request body.

use super::AppState;
use crate::error::ApiError;
use crate::vcenter::SpecDiff;
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use common::wire::{CbtStatusResponse, PowerOpRequest, PowerOpResponse, PowerStateResponse, VmInfo};
use common::Error;
use serde::Deserialize;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/vms/*tail", get(cbt_status))
        .route("/api/v1/vm-spec-changes", post(spec_changes))
        .route("/api/v1/vm/:vm_id/power-off", post(power_off))
        .route("/api/v1/vm/:vm_id/power-on", post(power_on))
        .route("/api/v1/vm/:vm_id/power-state", get(power_state))
}

#[derive(Deserialize)]
struct CbtQuery {
    vcenter: String,
    username: String,
    password: String,
}

/// Recovers the vm_path the caller intended from the wildcard tail: strips
/// the trailing `/cbt-status` and any doubled leading slash (vm_paths begin
/// with `/`, and `NodeClient::cbt_status` interpolates them directly into
/// the URL without escaping — spec §6's contract, not this handler's).
fn vm_path_from_tail(tail: &str) -> String {
    let trimmed = tail.trim_end_matches("/cbt-status").trim_start_matches('/');
    format!("/{trimmed}")
}

async fn cbt_status(
    State(state): State<AppState>,
    Path(tail): Path<String>,
    Query(query): Query<CbtQuery>,
) -> Result<Json<CbtStatusResponse>, ApiError> {
    let vm_path = vm_path_from_tail(&tail);
    let credential = common::wire::VCenterCredential { vcenter: query.vcenter, username: query.username, password: query.password };
    Ok(Json(state.replication.cbt_status(&vm_path, &credential).await?))
}

#[derive(Deserialize)]
struct SpecChangesRequest {
    stored: VmInfo,
}

async fn spec_changes(State(state): State<AppState>, Json(req): Json<SpecChangesRequest>) -> Result<Json<SpecDiff>, ApiError> {
    let credential = default_credential(&state)?;
    Ok(Json(state.vcenter.detect_spec_changes(&req.stored, &credential).await?))
}

async fn power_off(State(state): State<AppState>, Path(vm_id): Path<String>, Json(req): Json<PowerOpRequest>) -> Result<Json<PowerOpResponse>, ApiError> {
    let credential = default_credential(&state)?;
    Ok(Json(state.replication.power_off(&vm_id, req, &credential).await?))
}

async fn power_on(State(state): State<AppState>, Path(vm_id): Path<String>, Json(req): Json<PowerOpRequest>) -> Result<Json<PowerOpResponse>, ApiError> {
    let credential = default_credential(&state)?;
    Ok(Json(state.replication.power_on(&vm_id, req, &credential).await?))
}

async fn power_state(State(state): State<AppState>, Path(vm_id): Path<String>) -> Result<Json<PowerStateResponse>, ApiError> {
    let credential = default_credential(&state)?;
    Ok(Json(state.replication.power_state(&vm_id, &credential).await?))
}

fn default_credential(state: &AppState) -> Result<common::wire::VCenterCredential, Error> {
    state
        .config
        .default_credential
        .clone()
        .ok_or_else(|| Error::precondition("node has no default vCenter credential configured"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_path_from_tail_strips_suffix_and_doubled_slash() {
        assert_eq!(vm_path_from_tail("/dc1/vm/web01/cbt-status"), "/dc1/vm/web01");
        assert_eq!(vm_path_from_tail("web01/cbt-status"), "/web01");
    }
}
