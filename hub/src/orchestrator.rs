//! M2 replication orchestrator: the per-VM state machine that coordinates
//! L3 (via the Node), L4, L5 and M1, and persists CBT history (spec §4.M2).
//!
//! Mirrors the teacher's `ReplicationManager`: jobs are tracked in a map,
//! `start_replication` spawns a background task that drives the phases, and
//! each phase persists its result before moving on so a crash mid-run can be
//! reclaimed on restart.

use crate::cloud::{CloudAdapter, NetworkMapping, VolumeSpec};
use crate::nbd::NbdTargetManager;
use crate::node_client::NodeClient;
use crate::store::{contexts, jobs, scheduling, volumes};
use async_trait::async_trait;
use chrono::Utc;
use common::wire::{NbdTarget, ReplicateRequest, VCenterCredential};
use common::{
    CbtHistoryEntry, ContextStatus, Error, ExecutionStatus, JobStatus, JobType, OsseaVolume, ProgressUpdate,
    ReplicationJob, VmContext, VmDisk, VolumeStatus, VolumeType,
};
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Resolves which Node a given context's calls should go through. A Hub
/// may have many enrolled nodes; replication for a context always goes
/// through the node that owns its vCenter.
#[async_trait]
pub trait NodeClientResolver: Send + Sync {
    async fn client_for(&self, context: &VmContext) -> Result<Arc<NodeClient>, Error>;
}

/// Resolves a stored `credential_id` into the vCenter credential the Node
/// needs. Kept as a narrow seam so the orchestrator doesn't need to know
/// how credentials are vaulted.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, credential_id: &str) -> Result<VCenterCredential, Error>;
}

const EXTERNAL_CALL_TIMEOUT: Duration = Duration::from_secs(120);
const CLOUD_ZONE_ID: &str = "default-zone";
const CLOUD_DISK_OFFERING_ID: &str = "default-disk-offering";

#[derive(Clone)]
pub struct ReplicationOrchestrator {
    pool: SqlitePool,
    node_clients: Arc<dyn NodeClientResolver>,
    credentials: Arc<dyn CredentialResolver>,
    cloud: Arc<dyn CloudAdapter>,
    nbd: Arc<NbdTargetManager>,
    progress: Arc<crate::progress::ProgressBus>,
    /// Contexts currently owned by a running task runner (spec §5:
    /// "at most one task runner owns a given context_id at a time").
    owned_contexts: Arc<RwLock<HashSet<String>>>,
}

impl ReplicationOrchestrator {
    pub fn new(
        pool: SqlitePool,
        node_clients: Arc<dyn NodeClientResolver>,
        credentials: Arc<dyn CredentialResolver>,
        cloud: Arc<dyn CloudAdapter>,
        nbd: Arc<NbdTargetManager>,
        progress: Arc<crate::progress::ProgressBus>,
    ) -> Self {
        Self { pool, node_clients, credentials, cloud, nbd, progress, owned_contexts: Arc::new(RwLock::new(HashSet::new())) }
    }

    /// Creates a `ReplicationJob`, claims the context via the store's CAS on
    /// `current_job_id`, and spawns the background task that drives it.
    /// Returns the new job id. Fails `Conflict` if the context already has
    /// an active job (spec invariant: at most one non-terminal job per
    /// context).
    pub async fn start_replication(&self, context_id: &str) -> Result<String, Error> {
        self.start_replication_for_execution(context_id, None).await
    }

    /// Same as `start_replication`, but links the new job to the
    /// `ScheduleExecution` that emitted it so the orchestrator's terminal
    /// transition can update that execution's counters and status (spec
    /// §4.T1). `execution_id` is set on the job row before it is spawned,
    /// so there is no window where the background task could complete
    /// before the link exists.
    pub async fn start_replication_for_execution(&self, context_id: &str, execution_id: Option<&str>) -> Result<String, Error> {
        let context = contexts::get(&self.pool, context_id).await?;
        if context.has_active_job() {
            return Err(Error::conflict(format!("context '{context_id}' already has an active job")));
        }

        let job_type = if jobs::list_for_context(&self.pool, context_id).await?.iter().any(|j| j.status == JobStatus::Completed) {
            JobType::Incremental
        } else {
            JobType::Initial
        };
        let mut job = ReplicationJob::new(context_id, job_type);
        job.execution_id = execution_id.map(str::to_string);
        jobs::create(&self.pool, &job).await?;

        contexts::cas_current_job(&self.pool, context_id, None, context.version, Some(&job.job_id)).await?;

        let this = self.clone();
        let job_id = job.job_id.clone();
        tokio::spawn(async move {
            this.run(job_id).await;
        });
        Ok(job.job_id)
    }

    async fn run(self, job_id: String) {
        let job = match jobs::get(&self.pool, &job_id).await {
            Ok(j) => j,
            Err(e) => {
                error!(job_id, error = %e, "job vanished before it could run");
                return;
            }
        };
        {
            let mut owned = self.owned_contexts.write().await;
            if !owned.insert(job.context_id.clone()) {
                warn!(context_id = %job.context_id, "context already owned by another task runner, yielding");
                return;
            }
        }

        let result = self.run_phases(&job).await;

        {
            let mut owned = self.owned_contexts.write().await;
            owned.remove(&job.context_id);
        }

        let final_status = match &result {
            Ok(()) => JobStatus::Completed,
            Err(_) if job_was_cancelled(&self.pool, &job_id).await => JobStatus::Cancelled,
            Err(_) => JobStatus::Failed,
        };
        let error_message = result.as_ref().err().map(|e| e.to_string());
        if let Err(e) = jobs::update_status(&self.pool, &job_id, final_status, error_message.as_deref()).await {
            error!(job_id, error = %e, "failed to persist final job status");
        }
        if let Some(execution_id) = &job.execution_id {
            if let Err(e) = self.settle_execution(execution_id, final_status).await {
                error!(job_id, execution_id, error = %e, "failed to update schedule execution on job completion");
            }
        }
        self.progress
            .publish(ProgressUpdate {
                job_id: job_id.clone(),
                phase: format!("{final_status:?}").to_lowercase(),
                percent: if final_status == JobStatus::Completed { 100.0 } else { 0.0 },
                bytes_transferred: 0,
                bytes_total: 0,
                throughput_mbps: 0.0,
                eta_seconds: None,
                error: error_message,
            })
            .await;

        // Terminal: release the context's NBD exports and clear current_job_id.
        if let Err(e) = self.nbd.release_for_job(&self.pool, &job_id).await {
            warn!(job_id, error = %e, "failed to release NBD exports on job completion");
        }
        if let Ok(context) = contexts::get(&self.pool, &job.context_id).await {
            let next_status = match final_status {
                JobStatus::Completed => ContextStatus::Ready,
                _ => ContextStatus::Failed,
            };
            let _ = contexts::update_status(&self.pool, &job.context_id, next_status).await;
            let _ = contexts::cas_current_job(&self.pool, &job.context_id, Some(&job_id), context.version, None).await;
        }
    }

    /// Bumps the owning `ScheduleExecution`'s completed/failed counter for
    /// this job and, once every job it created has reached a terminal state,
    /// advances the execution itself out of `running` (spec §4.T1: "the
    /// execution row is advanced through running → completed|failed when
    /// all its emitted jobs reach terminal state; counters updated
    /// atomically at each child transition").
    async fn settle_execution(&self, execution_id: &str, job_final_status: JobStatus) -> Result<(), Error> {
        let counter = match job_final_status {
            JobStatus::Completed => scheduling::ExecutionCounter::Completed,
            JobStatus::Failed | JobStatus::Cancelled => scheduling::ExecutionCounter::Failed,
            _ => scheduling::ExecutionCounter::Failed,
        };
        scheduling::increment_execution_counter(&self.pool, execution_id, counter).await?;

        let execution = scheduling::get_execution(&self.pool, execution_id).await?;
        let accounted = execution.jobs_completed + execution.jobs_failed + execution.jobs_skipped;
        if accounted >= execution.jobs_created {
            let status = if execution.jobs_failed > 0 { ExecutionStatus::Failed } else { ExecutionStatus::Completed };
            scheduling::set_execution_status(&self.pool, execution_id, status).await?;
        }
        Ok(())
    }

    async fn run_phases(&self, job: &ReplicationJob) -> Result<(), Error> {
        let context = contexts::get(&self.pool, &job.context_id).await?;
        let node = self.node_clients.client_for(&context).await?;
        let credential = self.credentials.resolve(&context.credential_id).await?;

        self.enter_phase(job, JobStatus::Provisioning, ContextStatus::Provisioning).await?;
        let disks = self.provision(job, &context, &credential, &node).await?;
        self.check_cancelled(&job.job_id).await?;

        self.enter_phase(job, JobStatus::Snapshotting, ContextStatus::Snapshotting).await?;
        self.check_cancelled(&job.job_id).await?;

        self.enter_phase(job, JobStatus::Transferring, ContextStatus::Transferring).await?;
        let nbd_targets = self.allocate_nbd_targets(job, &disks).await?;
        self.transfer(job, &context, &credential, &node, &nbd_targets).await?;
        self.check_cancelled(&job.job_id).await?;

        self.enter_phase(job, JobStatus::Finalising, ContextStatus::Finalising).await?;
        self.finalise(job, &disks).await?;
        Ok(())
    }

    async fn enter_phase(&self, job: &ReplicationJob, job_status: JobStatus, context_status: ContextStatus) -> Result<(), Error> {
        jobs::update_status(&self.pool, &job.job_id, job_status, None).await?;
        contexts::update_status(&self.pool, &job.context_id, context_status).await?;
        Ok(())
    }

    async fn check_cancelled(&self, job_id: &str) -> Result<(), Error> {
        let job = jobs::get(&self.pool, job_id).await?;
        if job.cancel_requested {
            return Err(Error::precondition(format!("job '{job_id}' was cancelled")));
        }
        Ok(())
    }

    /// `provisioning`: diff stored disks against vCenter, request volumes
    /// for added/resized disks via L4, attach to the appliance, persist the
    /// volume<->disk mapping.
    async fn provision(
        &self,
        job: &ReplicationJob,
        context: &VmContext,
        credential: &VCenterCredential,
        node: &NodeClient,
    ) -> Result<Vec<VmDisk>, Error> {
        let discover = node
            .discover(
                &common::wire::DiscoverRequest { credential: credential.clone(), filter: Some(context.moref.clone()) },
                EXTERNAL_CALL_TIMEOUT,
            )
            .await?;
        let vm = discover
            .vms
            .into_iter()
            .find(|v| v.moref == context.moref)
            .ok_or_else(|| Error::not_found(format!("vCenter no longer reports moref '{}'", context.moref)))?;

        let mut disks = Vec::with_capacity(vm.disks.len());
        for (idx, disk_info) in vm.disks.into_iter().enumerate() {
            let provisioning = if disk_info.provisioning_type == "thick" {
                common::ProvisioningType::Thick
            } else {
                common::ProvisioningType::Thin
            };
            let mut disk = VmDisk::new(
                &job.job_id,
                &disk_info.disk_id,
                &disk_info.vmdk_path,
                disk_info.size_gb,
                disk_info.capacity_bytes,
                &disk_info.datastore,
                disk_info.unit_number,
                provisioning,
            );
            jobs::create_disk(&self.pool, &disk).await?;

            let request_id = format!("{}:provision:{}", job.job_id, disk.disk_id);
            let handle = self
                .cloud
                .create_volume(
                    &request_id,
                    &VolumeSpec {
                        name: format!("{}-disk-{idx}", context.display_name),
                        size_gb: disk_info.size_gb,
                        disk_offering_id: CLOUD_DISK_OFFERING_ID.to_string(),
                        zone_id: CLOUD_ZONE_ID.to_string(),
                    },
                )
                .await?;
            let device_path = self.cloud.attach_volume_to_appliance(&request_id, &handle.external_id).await?;

            let volume = OsseaVolume {
                volume_id: uuid::Uuid::new_v4().to_string(),
                external_id: handle.external_id,
                size_gb: handle.size_gb,
                volume_type: VolumeType::Data,
                device_path: Some(device_path),
                mount_point: None,
                status: VolumeStatus::AttachedToAppliance,
                created_at: Utc::now(),
            };
            volumes::create_volume(&self.pool, &volume).await?;
            jobs::assign_volume(&self.pool, &disk.disk_id, &volume.volume_id).await?;
            disk.ossea_volume_id = Some(volume.volume_id);
            disks.push(disk);
        }
        Ok(disks)
    }

    async fn allocate_nbd_targets(&self, job: &ReplicationJob, disks: &[VmDisk]) -> Result<Vec<NbdTarget>, Error> {
        let mut targets = Vec::with_capacity(disks.len());
        for disk in disks {
            let locator = self.nbd.allocate(&self.pool, &job.job_id, &disk.disk_id).await?;
            targets.push(NbdTarget { disk_id: disk.disk_id.clone(), locator });
        }
        Ok(targets)
    }

    /// `snapshotting` + `transferring`: the Node owns both, since taking the
    /// snapshot and streaming extents both happen over the vCenter/mover
    /// pipeline it supervises; the Hub asks for both in one `replicate` call
    /// and polls progress (spec §4.M2, §4.M1).
    async fn transfer(
        &self,
        job: &ReplicationJob,
        context: &VmContext,
        credential: &VCenterCredential,
        node: &NodeClient,
        nbd_targets: &[NbdTarget],
    ) -> Result<(), Error> {
        let mut previous_change_ids = std::collections::HashMap::new();
        for target in nbd_targets {
            if let Some(change_id) = jobs::last_completed_change_id(&self.pool, &context.context_id, &target.disk_id).await? {
                previous_change_ids.insert(target.disk_id.clone(), change_id);
            }
        }

        node.replicate(
            &ReplicateRequest {
                job_id: job.job_id.clone(),
                vcenter: context.vcenter_host.clone(),
                credentials: credential.clone(),
                vm_paths: vec![context.path.clone()],
                nbd_targets: nbd_targets.to_vec(),
                previous_change_ids,
            },
            EXTERNAL_CALL_TIMEOUT,
        )
        .await?;

        // Polls both progress and status each tick rather than stopping at
        // percent>=100: the mover's byte-pipe can report a full transfer
        // slightly before the Node settles the job's terminal status, and
        // `disk_change_ids` is only populated once that settlement happens
        // (spec §4.M1/§4.M2: "record per-disk disk_change_id when the mover
        // reports it").
        loop {
            self.check_cancelled(&job.job_id).await?;
            let progress = node.progress(&job.job_id, EXTERNAL_CALL_TIMEOUT).await?;
            jobs::update_progress(
                &self.pool,
                &job.job_id,
                progress.percent,
                progress.bytes_transferred,
                progress.bytes_total,
                progress.throughput_mbps,
            )
            .await?;
            self.progress
                .publish(ProgressUpdate {
                    job_id: job.job_id.clone(),
                    phase: progress.phase.clone(),
                    percent: progress.percent,
                    bytes_transferred: progress.bytes_transferred,
                    bytes_total: progress.bytes_total,
                    throughput_mbps: progress.throughput_mbps,
                    eta_seconds: None,
                    error: None,
                })
                .await;

            let status = node.job_status(&job.job_id, EXTERNAL_CALL_TIMEOUT).await?;
            if status.status == "completed" {
                for target in nbd_targets {
                    let change_id = status.disk_change_ids.get(&target.disk_id).ok_or_else(|| {
                        Error::fatal(format!("disk '{}' completed with no reported change id", target.disk_id))
                    })?;
                    jobs::update_disk_progress(&self.pool, &target.disk_id, 100.0, Some(change_id.as_str())).await?;
                }
                return Ok(());
            }
            if status.status == "failed" {
                return Err(Error::fatal(status.error.unwrap_or_else(|| "mover reported failure".into())));
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// `finalising`: delete the snapshot unconditionally, then either write
    /// CBT history and mark the job completed, or leave it for the caller to
    /// mark failed (spec invariant: a snapshot is always deleted).
    async fn finalise(&self, job: &ReplicationJob, disks: &[VmDisk]) -> Result<(), Error> {
        if let Err(e) = self.node_clients_cleanup(job).await {
            warn!(job_id = %job.job_id, error = %e, "snapshot cleanup failed, continuing finalisation");
        }

        for disk in disks {
            let cbt_status = jobs::list_disks_for_job(&self.pool, &job.job_id)
                .await?
                .into_iter()
                .find(|d| d.disk_id == disk.disk_id)
                .and_then(|d| d.disk_change_id);
            if let Some(change_id) = cbt_status {
                jobs::record_cbt(
                    &self.pool,
                    &CbtHistoryEntry {
                        job_id: job.job_id.clone(),
                        disk_id: disk.disk_id.clone(),
                        change_id,
                        sync_type: job.job_type,
                        blocks_changed: 0,
                        bytes_transferred: disk.capacity_bytes,
                        duration_seconds: 0.0,
                        success: true,
                        recorded_at: Utc::now(),
                    },
                )
                .await?;
            } else {
                return Err(Error::fatal(format!("disk '{}' reported no fresh change id", disk.disk_id)));
            }
            if let Some(volume_id) = &disk.ossea_volume_id {
                volumes::set_volume_status(&self.pool, volume_id, VolumeStatus::AttachedToAppliance).await?;
            }
        }
        Ok(())
    }

    async fn node_clients_cleanup(&self, job: &ReplicationJob) -> Result<(), Error> {
        let context = contexts::get(&self.pool, &job.context_id).await?;
        let node = self.node_clients.client_for(&context).await?;
        node.cleanup(
            &common::wire::CleanupRequest { job_id: job.job_id.clone(), action: common::wire::CleanupAction::DeleteSnapshot },
            EXTERNAL_CALL_TIMEOUT,
        )
        .await
    }

    pub async fn cancel(&self, job_id: &str) -> Result<(), Error> {
        jobs::set_cancel_requested(&self.pool, job_id).await
    }
}

async fn job_was_cancelled(pool: &SqlitePool, job_id: &str) -> bool {
    jobs::get(pool, job_id).await.map(|j| j.cancel_requested).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{CloudVmHandle, VolumeHandle};
    use crate::store::Database;
    use common::VmContext;

    struct UnreachableNode;
    #[async_trait]
    impl NodeClientResolver for UnreachableNode {
        async fn client_for(&self, _context: &VmContext) -> Result<Arc<NodeClient>, Error> {
            Err(Error::unavailable("no node enrolled for test"))
        }
    }

    struct StubCredentials;
    #[async_trait]
    impl CredentialResolver for StubCredentials {
        async fn resolve(&self, _credential_id: &str) -> Result<VCenterCredential, Error> {
            Ok(VCenterCredential { vcenter: "vc1".into(), username: "svc".into(), password: "secret".into() })
        }
    }

    struct StubCloud;
    #[async_trait]
    impl CloudAdapter for StubCloud {
        async fn create_volume(&self, _r: &str, spec: &VolumeSpec) -> Result<VolumeHandle, Error> {
            Ok(VolumeHandle { external_id: "vol-1".into(), size_gb: spec.size_gb, device_path: None })
        }
        async fn attach_volume_to_appliance(&self, _r: &str, _volume_id: &str) -> Result<String, Error> {
            Ok("/dev/xvdb".into())
        }
        async fn detach_volume(&self, _r: &str, _volume_id: &str) -> Result<(), Error> {
            Ok(())
        }
        async fn attach_volume_to_vm(&self, _r: &str, _volume_id: &str, _vm_id: &str) -> Result<(), Error> {
            Ok(())
        }
        async fn create_vm(&self, _r: &str, spec: &crate::cloud::VmSpec, _networks: &[NetworkMapping]) -> Result<CloudVmHandle, Error> {
            Ok(CloudVmHandle { external_id: "vm-1".into(), name: spec.name.clone() })
        }
        async fn destroy_vm(&self, _r: &str, _vm_id: &str) -> Result<(), Error> {
            Ok(())
        }
        async fn attach_network(&self, _r: &str, _vm_id: &str, _mapping: &NetworkMapping) -> Result<(), Error> {
            Ok(())
        }
    }

    fn orchestrator(pool: SqlitePool) -> ReplicationOrchestrator {
        ReplicationOrchestrator::new(
            pool,
            Arc::new(UnreachableNode),
            Arc::new(StubCredentials),
            Arc::new(StubCloud),
            Arc::new(NbdTargetManager::new("hub.local")),
            Arc::new(crate::progress::ProgressBus::new()),
        )
    }

    #[tokio::test]
    async fn start_replication_rejects_context_with_active_job() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let ctx = VmContext::new("vc1", "dc1", "vm-1", "/dc1/vm/vm-1", "web01", "cred-1");
        contexts::create(db.pool(), &ctx).await.unwrap();
        contexts::cas_current_job(db.pool(), &ctx.context_id, None, 0, Some("job-x")).await.unwrap();

        let orch = orchestrator(db.pool().clone());
        let err = orch.start_replication(&ctx.context_id).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn start_replication_fails_job_when_node_unreachable() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let ctx = VmContext::new("vc1", "dc1", "vm-1", "/dc1/vm/vm-1", "web01", "cred-1");
        contexts::create(db.pool(), &ctx).await.unwrap();

        let orch = orchestrator(db.pool().clone());
        let job_id = orch.start_replication(&ctx.context_id).await.unwrap();

        // Give the spawned task a chance to run to completion.
        for _ in 0..50 {
            let job = jobs::get(db.pool(), &job_id).await.unwrap();
            if job.status.is_terminal() {
                assert_eq!(job.status, JobStatus::Failed);
                let refreshed = contexts::get(db.pool(), &ctx.context_id).await.unwrap();
                assert_eq!(refreshed.current_job_id, None);
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job never reached a terminal state");
    }
}
