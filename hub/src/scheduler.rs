//! T1 scheduler: evaluates cron expressions on a coarse tick, expands due
//! schedules into their group's member contexts, and admits each member
//! through the three rules spec §4.T1 states before starting a job.
//!
//! Cron evaluation itself is `croner`, not something this crate reimplements;
//! the scheduler's own job is admission control and execution bookkeeping.

use crate::orchestrator::ReplicationOrchestrator;
use crate::store::{failover, scheduling};
use chrono::{DateTime, Utc};
use common::{Error, ExecutionStatus, ReplicationSchedule, ScheduleExecution};
use croner::Cron;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct Scheduler {
    pool: SqlitePool,
    orchestrator: ReplicationOrchestrator,
    tick_interval: Duration,
    /// Last tick's clock reading per schedule, so a schedule only fires for
    /// occurrences strictly between the previous tick and this one — a
    /// missed tick (process paused, clock skew) never re-fires every
    /// occurrence it slept through (spec §4.T1 catch-up semantics).
    last_tick: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
}

impl Scheduler {
    pub fn new(pool: SqlitePool, orchestrator: ReplicationOrchestrator, tick_seconds: u64) -> Self {
        Self {
            pool,
            orchestrator,
            tick_interval: Duration::from_secs(tick_seconds.max(1)),
            last_tick: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Runs the tick loop until the process exits. Intended to be
    /// `tokio::spawn`ed once from `main`.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.tick_interval);
        loop {
            interval.tick().await;
            if let Err(e) = self.tick().await {
                error!(error = %e, "scheduler tick failed");
            }
        }
    }

    async fn tick(&self) -> Result<(), Error> {
        let now = Utc::now();
        let schedules = scheduling::list_enabled_schedules(&self.pool).await?;
        for schedule in schedules {
            if let Err(e) = self.evaluate_schedule(&schedule, now).await {
                warn!(schedule_id = %schedule.schedule_id, error = %e, "schedule evaluation failed");
            }
        }
        Ok(())
    }

    /// A schedule is due if a cron occurrence falls in `(previous tick, now]`.
    /// The very first tick after process start only establishes a baseline
    /// and never fires, so a restart can't replay everything cron ever
    /// would have fired historically.
    async fn evaluate_schedule(&self, schedule: &ReplicationSchedule, now: DateTime<Utc>) -> Result<(), Error> {
        let cron = Cron::new(&schedule.cron_expression)
            .parse()
            .map_err(|e| Error::precondition(format!("invalid cron expression '{}': {e}", schedule.cron_expression)))?;

        let previous = {
            let mut last = self.last_tick.lock().await;
            let previous = last.insert(schedule.schedule_id.clone(), now);
            previous
        };
        let Some(previous) = previous else {
            return Ok(());
        };

        let next_occurrence = cron
            .find_next_occurrence(&previous, false)
            .map_err(|e| Error::fatal(format!("cron evaluation failed: {e}")))?;
        if next_occurrence > now {
            return Ok(());
        }

        self.fire_schedule(schedule, now).await
    }

    async fn fire_schedule(&self, schedule: &ReplicationSchedule, scheduled_at: DateTime<Utc>) -> Result<(), Error> {
        let groups = scheduling::groups_for_schedule(&self.pool, &schedule.schedule_id).await?;
        for group in groups {
            let execution = ScheduleExecution::new(&schedule.schedule_id, &group.group_id, scheduled_at);
            scheduling::create_execution(&self.pool, &execution).await?;
            scheduling::set_execution_status(&self.pool, &execution.execution_id, ExecutionStatus::Running).await?;

            let members = scheduling::list_enabled_memberships(&self.pool, &group.group_id).await?;
            let mut members = members.into_iter();
            while let Some(member) = members.next() {
                let running = scheduling::count_running_jobs_for_group(&self.pool, &group.group_id).await?;
                if running >= group.max_concurrent_vms {
                    let remaining = members.len() + 1;
                    info!(group_id = %group.group_id, remaining, "per-group concurrency cap reached, remaining members skipped this tick");
                    for _ in 0..remaining {
                        scheduling::increment_execution_counter(&self.pool, &execution.execution_id, scheduling::ExecutionCounter::Skipped)
                            .await?;
                    }
                    break;
                }
                match self.admit_and_start(&member.context_id, &execution.execution_id).await {
                    Ok(()) => {
                        scheduling::increment_execution_counter(&self.pool, &execution.execution_id, scheduling::ExecutionCounter::Created)
                            .await?;
                    }
                    Err(Error::Conflict(_)) | Err(Error::Precondition(_)) => {
                        scheduling::increment_execution_counter(&self.pool, &execution.execution_id, scheduling::ExecutionCounter::Skipped)
                            .await?;
                    }
                    Err(e) => {
                        warn!(context_id = %member.context_id, error = %e, "scheduled replication failed to start");
                        scheduling::increment_execution_counter(&self.pool, &execution.execution_id, scheduling::ExecutionCounter::Failed)
                            .await?;
                    }
                }
            }

            // If no job was actually created (an empty/disabled group, or
            // every member skipped/failed to admit synchronously), there is
            // nothing for the orchestrator to settle later, so finalise the
            // execution here. Otherwise at least one job is now running and
            // the execution stays `running` until the orchestrator's
            // terminal transition for each of those jobs calls
            // `settle_execution` and advances it (spec §4.T1).
            let execution_now = scheduling::get_execution(&self.pool, &execution.execution_id).await?;
            if execution_now.jobs_created == 0 {
                let status = if execution_now.jobs_failed > 0 { ExecutionStatus::Failed } else { ExecutionStatus::Skipped };
                scheduling::set_execution_status(&self.pool, &execution.execution_id, status).await?;
            }
        }
        Ok(())
    }

    /// Admission rule 3 (source conflict with an active failover) is
    /// checked here; rules 1 (group concurrency) and 2 (per-VM exclusivity)
    /// are enforced by the group loop above and by the orchestrator's own
    /// `has_active_job` check respectively (spec §4.T1).
    async fn admit_and_start(&self, context_id: &str, execution_id: &str) -> Result<(), Error> {
        if failover::find_active_for_context(&self.pool, context_id).await?.is_some() {
            return Err(Error::precondition(format!(
                "context '{context_id}' has an active failover or rollback"
            )));
        }
        self.orchestrator.start_replication_for_execution(context_id, Some(execution_id)).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{CloudAdapter, CloudVmHandle, NetworkMapping, VolumeHandle, VolumeSpec, VmSpec};
    use crate::nbd::NbdTargetManager;
    use crate::orchestrator::{CredentialResolver, NodeClientResolver};
    use crate::progress::ProgressBus;
    use crate::store::{contexts, Database};
    use async_trait::async_trait;
    use common::wire::VCenterCredential;
    use common::{ReplicationSchedule, VmContext, VmGroupMembership, VmMachineGroup};

    struct UnreachableNode;
    #[async_trait]
    impl NodeClientResolver for UnreachableNode {
        async fn client_for(&self, _context: &VmContext) -> Result<Arc<crate::node_client::NodeClient>, Error> {
            Err(Error::unavailable("no node enrolled for test"))
        }
    }

    struct StubCredentials;
    #[async_trait]
    impl CredentialResolver for StubCredentials {
        async fn resolve(&self, _credential_id: &str) -> Result<VCenterCredential, Error> {
            Ok(VCenterCredential { vcenter: "vc1".into(), username: "svc".into(), password: "x".into() })
        }
    }

    struct StubCloud;
    #[async_trait]
    impl CloudAdapter for StubCloud {
        async fn create_volume(&self, _r: &str, spec: &VolumeSpec) -> Result<VolumeHandle, Error> {
            Ok(VolumeHandle { external_id: "vol-1".into(), size_gb: spec.size_gb, device_path: None })
        }
        async fn attach_volume_to_appliance(&self, _r: &str, _v: &str) -> Result<String, Error> {
            Ok("/dev/xvdb".into())
        }
        async fn detach_volume(&self, _r: &str, _v: &str) -> Result<(), Error> {
            Ok(())
        }
        async fn attach_volume_to_vm(&self, _r: &str, _v: &str, _vm: &str) -> Result<(), Error> {
            Ok(())
        }
        async fn create_vm(&self, _r: &str, spec: &VmSpec, _n: &[NetworkMapping]) -> Result<CloudVmHandle, Error> {
            Ok(CloudVmHandle { external_id: "vm-1".into(), name: spec.name.clone() })
        }
        async fn destroy_vm(&self, _r: &str, _vm: &str) -> Result<(), Error> {
            Ok(())
        }
        async fn attach_network(&self, _r: &str, _vm: &str, _m: &NetworkMapping) -> Result<(), Error> {
            Ok(())
        }
    }

    fn scheduler(pool: SqlitePool) -> Scheduler {
        let orchestrator = ReplicationOrchestrator::new(
            pool.clone(),
            Arc::new(UnreachableNode),
            Arc::new(StubCredentials),
            Arc::new(StubCloud),
            Arc::new(NbdTargetManager::new("hub.local")),
            Arc::new(ProgressBus::new()),
        );
        Scheduler::new(pool, orchestrator, 1)
    }

    #[tokio::test]
    async fn first_tick_establishes_baseline_without_firing() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let schedule = ReplicationSchedule::new("every-minute", "* * * * *");
        scheduling::create_schedule(db.pool(), &schedule).await.unwrap();

        let sched = scheduler(db.pool().clone());
        sched.tick().await.unwrap();

        let executions_before = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM schedule_executions")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(executions_before, 0);
    }

    #[tokio::test]
    async fn group_concurrency_cap_skips_remaining_members() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let schedule = ReplicationSchedule::new("every-minute", "* * * * *");
        scheduling::create_schedule(db.pool(), &schedule).await.unwrap();
        let mut group = VmMachineGroup::new("g1", 1, "operator");
        group.schedule_id = Some(schedule.schedule_id.clone());
        scheduling::create_group(db.pool(), &group).await.unwrap();

        for name in ["vm-a", "vm-b"] {
            let ctx = VmContext::new("vc1", "dc1", name, "/p", name, "cred");
            contexts::create(db.pool(), &ctx).await.unwrap();
            scheduling::add_membership(
                db.pool(),
                &VmGroupMembership { group_id: group.group_id.clone(), context_id: ctx.context_id.clone(), priority: 0, enabled: true, added_at: Utc::now() },
            )
            .await
            .unwrap();
        }

        let sched = scheduler(db.pool().clone());
        sched.fire_schedule(&schedule, Utc::now()).await.unwrap();

        // max_concurrent_vms=1: the first member's job is created (and thus
        // counted as running) before the second member is ever considered,
        // so the cap check sees 1 >= 1 and stops the loop without starting
        // a second job — but the second member is still recorded as skipped.
        let jobs = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM replication_jobs")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(jobs, 1);

        let executions = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM schedule_executions")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(executions, 1);

        let skipped = sqlx::query_scalar::<_, i64>("SELECT jobs_skipped FROM schedule_executions")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(skipped, 1);
    }
}
