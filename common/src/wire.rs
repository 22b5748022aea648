//! JSON wire types shared by the Node control API and the Hub's calls into
//! it, plus the Hub enrolment API. Kept separate from the entity types
//! because the wire shape is a contract with an external collaborator (the
//! other appliance) and must not drift just because a store column is
//! renamed.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------
// Node control API (spec.md §6, over the tunnel)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VCenterCredential {
    pub vcenter: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverRequest {
    pub credential: VCenterCredential,
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmDiskInfo {
    pub disk_id: String,
    pub vmdk_path: String,
    pub size_gb: u64,
    pub capacity_bytes: u64,
    pub datastore: String,
    pub unit_number: u32,
    pub provisioning_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmInfo {
    pub moref: String,
    pub path: String,
    pub display_name: String,
    pub datacenter: String,
    pub cpu_count: u32,
    pub memory_mb: u64,
    pub os_family: String,
    pub power_state: String,
    pub tools_status: String,
    pub disks: Vec<VmDiskInfo>,
    pub networks: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverResponse {
    pub vms: Vec<VmInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NbdTarget {
    pub disk_id: String,
    pub locator: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateRequest {
    pub job_id: String,
    pub vcenter: String,
    pub credentials: VCenterCredential,
    pub vm_paths: Vec<String>,
    pub nbd_targets: Vec<NbdTarget>,
    pub previous_change_ids: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateResponse {
    pub job_id: String,
    pub status: String,
    pub vm_count: u32,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CleanupAction {
    DeleteSnapshot,
    CleanupAll,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupRequest {
    pub job_id: String,
    pub action: CleanupAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: String,
    pub status: String,
    pub error: Option<String>,
    /// The CBT change-id each disk's mover produced on success, keyed by
    /// `disk_id`. Populated once that disk's mover reaches a terminal
    /// success; absent for disks still running or that failed. This is how
    /// the Hub's finalising phase learns the change-id to persist (spec
    /// §4.M2: "record per-disk disk_change_id when the mover reports it").
    pub disk_change_ids: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressResponse {
    pub job_id: String,
    pub phase: String,
    pub percent: f64,
    pub bytes_transferred: u64,
    pub bytes_total: u64,
    pub throughput_mbps: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CbtStatusResponse {
    pub change_id: Option<String>,
    pub changed_extents: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerOpRequest {
    pub force: bool,
    pub wait_for_tools: bool,
    pub wait_for_shutdown: bool,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerOpResponse {
    pub power_state: String,
    pub shutdown_method: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerStateResponse {
    pub power_state: String,
    pub tools_status: String,
    pub boot_time: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfigUpdate {
    pub nbd_port: u16,
    pub export_name: String,
    pub target_device: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub tunnel_state: String,
}

// ---------------------------------------------------------------------
// Hub enrolment API (spec.md §6)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollRequest {
    pub pairing_code: String,
    pub node_public_key: String,
    pub node_name: String,
    pub node_version: String,
    pub key_fingerprint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollResponse {
    pub enrollment_id: String,
    pub challenge: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollVerifyRequest {
    pub enrollment_id: String,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollResultResponse {
    pub status: String,
}
