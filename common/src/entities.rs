//! Domain entities shared by the Hub and Node binaries.
//!
//! These are plain value types — no ORM reflection, no `map[string]any`
//! update bags. Each mutable field group that a repository updates gets its
//! own typed patch record (see `*Patch` structs) so unset fields are never
//! written.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ---------------------------------------------------------------------
// VMContext
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStatus {
    Discovered,
    Provisioning,
    Snapshotting,
    Transferring,
    Finalising,
    Ready,
    FailedOverTest,
    FailedOverLive,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmContext {
    pub context_id: String,
    pub vcenter_host: String,
    pub datacenter: String,
    pub moref: String,
    pub path: String,
    pub display_name: String,
    pub cpu_count: u32,
    pub memory_mb: u64,
    pub os_family: String,
    pub power_state: String,
    pub discovered_at: DateTime<Utc>,
    pub current_status: ContextStatus,
    pub current_job_id: Option<String>,
    pub auto_added: bool,
    pub scheduler_enabled: bool,
    pub credential_id: String,
    /// CAS version. Bumped on every `current_job_id` transition.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VmContext {
    pub fn new(
        vcenter_host: impl Into<String>,
        datacenter: impl Into<String>,
        moref: impl Into<String>,
        path: impl Into<String>,
        display_name: impl Into<String>,
        credential_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            context_id: new_id(),
            vcenter_host: vcenter_host.into(),
            datacenter: datacenter.into(),
            moref: moref.into(),
            path: path.into(),
            display_name: display_name.into(),
            cpu_count: 0,
            memory_mb: 0,
            os_family: String::new(),
            power_state: "unknown".to_string(),
            discovered_at: now,
            current_status: ContextStatus::Discovered,
            current_job_id: None,
            auto_added: false,
            scheduler_enabled: true,
            credential_id: credential_id.into(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_active_job(&self) -> bool {
        self.current_job_id.is_some()
    }
}

// ---------------------------------------------------------------------
// ReplicationJob / VMDisk / CBTHistoryEntry
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Initial,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Discovered,
    Provisioning,
    Snapshotting,
    Transferring,
    Finalising,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationJob {
    pub job_id: String,
    pub context_id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub progress_percent: f64,
    pub bytes_transferred: u64,
    pub bytes_total: u64,
    pub transfer_rate_mbps: f64,
    /// change_id written by this run, per disk, keyed by disk_id.
    pub previous_change_ids: std::collections::HashMap<String, String>,
    pub snapshot_ref: Option<String>,
    pub target_config_ref: Option<String>,
    pub cancel_requested: bool,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// The `ScheduleExecution` that emitted this job, if any (spec §4.T1:
    /// "the scheduler hands each to M2 ... the execution row is advanced
    /// ... when all its emitted jobs reach terminal state"). `None` for
    /// operator-initiated jobs outside a schedule.
    pub execution_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReplicationJob {
    pub fn new(context_id: impl Into<String>, job_type: JobType) -> Self {
        let now = Utc::now();
        Self {
            job_id: new_id(),
            context_id: context_id.into(),
            job_type,
            status: JobStatus::Discovered,
            progress_percent: 0.0,
            bytes_transferred: 0,
            bytes_total: 0,
            transfer_rate_mbps: 0.0,
            previous_change_ids: std::collections::HashMap::new(),
            snapshot_ref: None,
            target_config_ref: None,
            cancel_requested: false,
            error: None,
            started_at: None,
            completed_at: None,
            execution_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningType {
    Thin,
    Thick,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmDisk {
    pub disk_id: String,
    pub job_id: String,
    pub source_disk_id: String,
    pub vmdk_path: String,
    pub size_gb: u64,
    pub capacity_bytes: u64,
    pub datastore: String,
    pub unit_number: u32,
    pub provisioning_type: ProvisioningType,
    pub ossea_volume_id: Option<String>,
    pub disk_change_id: Option<String>,
    pub progress_percent: f64,
}

impl VmDisk {
    pub fn new(
        job_id: impl Into<String>,
        source_disk_id: impl Into<String>,
        vmdk_path: impl Into<String>,
        size_gb: u64,
        capacity_bytes: u64,
        datastore: impl Into<String>,
        unit_number: u32,
        provisioning_type: ProvisioningType,
    ) -> Self {
        Self {
            disk_id: new_id(),
            job_id: job_id.into(),
            source_disk_id: source_disk_id.into(),
            vmdk_path: vmdk_path.into(),
            size_gb,
            capacity_bytes,
            datastore: datastore.into(),
            unit_number,
            provisioning_type,
            ossea_volume_id: None,
            disk_change_id: None,
            progress_percent: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CbtHistoryEntry {
    pub job_id: String,
    pub disk_id: String,
    pub change_id: String,
    pub sync_type: JobType,
    pub blocks_changed: u64,
    pub bytes_transferred: u64,
    pub duration_seconds: f64,
    pub success: bool,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------
// OsseaVolume / VolumeMount
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeType {
    Root,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeStatus {
    Unattached,
    AttachedToAppliance,
    AttachedToTargetVm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OsseaVolume {
    pub volume_id: String,
    pub external_id: String,
    pub size_gb: u64,
    pub volume_type: VolumeType,
    pub device_path: Option<String>,
    pub mount_point: Option<String>,
    pub status: VolumeStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountStatus {
    Unmounted,
    Mounting,
    Mounted,
    UnmountPending,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeMount {
    pub mount_id: String,
    pub volume_id: String,
    pub mount_path: String,
    pub status: MountStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------
// RestoreMount (T2)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreMountStatus {
    Mounting,
    Mounted,
    Unmounting,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreMountMode {
    Ro,
    Rw,
}

impl Default for RestoreMountMode {
    fn default() -> Self {
        RestoreMountMode::Ro
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreMount {
    pub mount_id: String,
    pub backup_id: String,
    pub mount_path: String,
    pub nbd_device: String,
    pub filesystem_type: String,
    pub mode: RestoreMountMode,
    pub status: RestoreMountStatus,
    pub last_accessed_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl RestoreMount {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|t| t < now).unwrap_or(false)
    }
}

// ---------------------------------------------------------------------
// FailoverJob / FailoverPhaseProgress
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverMode {
    Test,
    Live,
}

/// The seven phases of the unified failover state machine (spec §4.M3), in
/// execution order. Rollback walks this list backwards from whichever phase
/// last completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverPhase {
    PreflightValidation,
    SourceQuiesce,
    FinalDeltaSync,
    SnapshotTargetVolumes,
    CreateTargetVm,
    PowerOnTarget,
    Finalise,
}

impl FailoverPhase {
    const ORDER: [FailoverPhase; 7] = [
        FailoverPhase::PreflightValidation,
        FailoverPhase::SourceQuiesce,
        FailoverPhase::FinalDeltaSync,
        FailoverPhase::SnapshotTargetVolumes,
        FailoverPhase::CreateTargetVm,
        FailoverPhase::PowerOnTarget,
        FailoverPhase::Finalise,
    ];

    pub fn first() -> Self {
        Self::ORDER[0]
    }

    pub fn next(self) -> Option<FailoverPhase> {
        let idx = Self::ORDER.iter().position(|p| *p == self)?;
        Self::ORDER.get(idx + 1).copied()
    }

    pub fn index(self) -> usize {
        Self::ORDER.iter().position(|p| *p == self).expect("exhaustive")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverStatus {
    Running,
    Completed,
    Failed,
    RollingBack,
    RolledBack,
    RollbackFailed,
}

impl FailoverStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FailoverStatus::Completed | FailoverStatus::RolledBack | FailoverStatus::RollbackFailed)
    }
}

/// Parameters for the inverse rollback walk (spec §4.M3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RollbackOptions {
    pub power_on_source_vm: bool,
    pub force_cleanup: bool,
    pub failover_type: FailoverMode,
}

impl Default for RollbackOptions {
    fn default() -> Self {
        Self { power_on_source_vm: true, force_cleanup: false, failover_type: FailoverMode::Test }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverJob {
    pub failover_id: String,
    pub context_id: String,
    pub mode: FailoverMode,
    pub status: FailoverStatus,
    pub current_phase: FailoverPhase,
    pub target_vm_id: Option<String>,
    /// Set when this job is a rollback of an earlier failover.
    pub rollback_of: Option<String>,
    pub rollback_options: Option<RollbackOptions>,
    /// Operator-stated reason, recorded in both the original decision and a
    /// rollback's audit entries.
    pub reason: Option<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FailoverJob {
    pub fn new(context_id: impl Into<String>, mode: FailoverMode, reason: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            failover_id: new_id(),
            context_id: context_id.into(),
            mode,
            status: FailoverStatus::Running,
            current_phase: FailoverPhase::first(),
            target_vm_id: None,
            rollback_of: None,
            rollback_options: None,
            reason,
            error: None,
            started_at: Some(now),
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn new_rollback(original: &FailoverJob, options: RollbackOptions, reason: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            failover_id: new_id(),
            context_id: original.context_id.clone(),
            mode: original.mode,
            status: FailoverStatus::RollingBack,
            current_phase: original.current_phase,
            target_vm_id: original.target_vm_id.clone(),
            rollback_of: Some(original.failover_id.clone()),
            rollback_options: Some(options),
            reason,
            error: None,
            started_at: Some(now),
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One row per phase a `FailoverJob` has completed — the "persisted
/// phase-progress rows" a crash-resumed run re-derives its starting phase
/// from (spec §4.M3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverPhaseProgress {
    pub failover_id: String,
    pub phase: FailoverPhase,
    pub completed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------
// Scheduling: ReplicationSchedule / VMMachineGroup / VMGroupMembership /
// ScheduleExecution
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Replication,
    Failover,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_seconds: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, backoff_seconds: 30 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSchedule {
    pub schedule_id: String,
    pub name: String,
    pub cron_expression: String,
    pub schedule_type: ScheduleType,
    pub enabled: bool,
    pub retry_policy: RetryPolicy,
    pub created_at: DateTime<Utc>,
}

impl ReplicationSchedule {
    pub fn new(name: impl Into<String>, cron_expression: impl Into<String>) -> Self {
        Self {
            schedule_id: new_id(),
            name: name.into(),
            cron_expression: cron_expression.into(),
            schedule_type: ScheduleType::Replication,
            enabled: true,
            retry_policy: RetryPolicy::default(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmMachineGroup {
    pub group_id: String,
    pub name: String,
    pub schedule_id: Option<String>,
    pub max_concurrent_vms: u32,
    pub priority: i32,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl VmMachineGroup {
    pub fn new(name: impl Into<String>, max_concurrent_vms: u32, created_by: impl Into<String>) -> Self {
        Self {
            group_id: new_id(),
            name: name.into(),
            schedule_id: None,
            max_concurrent_vms: max_concurrent_vms.max(1),
            priority: 0,
            created_by: created_by.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmGroupMembership {
    pub group_id: String,
    pub context_id: String,
    pub priority: i32,
    pub enabled: bool,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleExecution {
    pub execution_id: String,
    pub schedule_id: String,
    pub group_id: String,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub jobs_created: u32,
    pub jobs_completed: u32,
    pub jobs_failed: u32,
    pub jobs_skipped: u32,
    pub duration_seconds: Option<f64>,
}

impl ScheduleExecution {
    pub fn new(schedule_id: impl Into<String>, group_id: impl Into<String>, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            execution_id: new_id(),
            schedule_id: schedule_id.into(),
            group_id: group_id.into(),
            scheduled_at,
            started_at: None,
            completed_at: None,
            status: ExecutionStatus::Pending,
            jobs_created: 0,
            jobs_completed: 0,
            jobs_failed: 0,
            jobs_skipped: 0,
            duration_seconds: None,
        }
    }
}

// ---------------------------------------------------------------------
// Node enrolment: PairingCode / Enrollment / ActiveConnection
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingCode {
    pub code: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consumed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    PendingVerification,
    AwaitingApproval,
    Approved,
    Rejected,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrollment {
    pub enrollment_id: String,
    pub pairing_code: String,
    pub node_name: String,
    pub node_version: String,
    pub node_public_key: String,
    pub key_fingerprint: String,
    pub challenge: String,
    pub status: EnrollmentStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Down,
    Connecting,
    Up,
    Degraded,
    Revoked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveConnection {
    pub enrollment_id: String,
    pub status: ConnectionStatus,
    pub last_seen: DateTime<Utc>,
    pub last_error: Option<String>,
}

// ---------------------------------------------------------------------
// AuditEvent (T3)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub severity: AuditSeverity,
    pub subject_id: Option<String>,
    pub operator: Option<String>,
    pub action: String,
    pub details: Option<String>,
}

impl AuditEvent {
    pub fn new(event_type: impl Into<String>, severity: AuditSeverity, action: impl Into<String>) -> Self {
        Self {
            event_id: new_id(),
            timestamp: Utc::now(),
            event_type: event_type.into(),
            severity,
            subject_id: None,
            operator: None,
            action: action.into(),
            details: None,
        }
    }

    pub fn with_subject(mut self, subject_id: impl Into<String>) -> Self {
        self.subject_id = Some(subject_id.into());
        self
    }

    pub fn with_operator(mut self, operator: impl Into<String>) -> Self {
        self.operator = Some(operator.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

// ---------------------------------------------------------------------
// Progress (T3, volatile)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub job_id: String,
    pub phase: String,
    pub percent: f64,
    pub bytes_transferred: u64,
    pub bytes_total: u64,
    pub throughput_mbps: f64,
    pub eta_seconds: Option<u64>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_context_has_no_active_job() {
        let ctx = VmContext::new("vc1", "dc1", "vm-100", "/dc1/vm/vm-100", "web01", "cred-1");
        assert!(!ctx.has_active_job());
        assert_eq!(ctx.current_status, ContextStatus::Discovered);
    }

    #[test]
    fn job_terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Transferring.is_terminal());
    }

    #[test]
    fn restore_mount_expiry() {
        let mut m = RestoreMount {
            mount_id: "m1".into(),
            backup_id: "b1".into(),
            mount_path: "/mnt/b1".into(),
            nbd_device: "/dev/nbd0".into(),
            filesystem_type: "ext4".into(),
            mode: RestoreMountMode::Ro,
            status: RestoreMountStatus::Mounted,
            last_accessed_at: Utc::now(),
            expires_at: Some(Utc::now() - chrono::Duration::seconds(1)),
            created_at: Utc::now(),
        };
        assert!(m.is_expired(Utc::now()));
        m.expires_at = None;
        assert!(!m.is_expired(Utc::now()));
    }
}
