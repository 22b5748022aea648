//! Repositories for `ReplicationSchedule`, `VMMachineGroup`,
//! `VMGroupMembership`, and `ScheduleExecution`.

use chrono::{DateTime, Utc};
use common::{
    Error, ExecutionStatus, RetryPolicy, ScheduleExecution, ScheduleType, VmGroupMembership,
    VmMachineGroup, ReplicationSchedule,
};
use sqlx::{Row, SqlitePool};

fn db_err(e: sqlx::Error) -> Error {
    Error::unavailable(e.to_string())
}

fn sched_type_str(t: ScheduleType) -> &'static str {
    match t {
        ScheduleType::Replication => "replication",
        ScheduleType::Failover => "failover",
    }
}

fn str_sched_type(s: &str) -> Result<ScheduleType, Error> {
    Ok(match s {
        "replication" => ScheduleType::Replication,
        "failover" => ScheduleType::Failover,
        other => return Err(Error::integrity(format!("unknown schedule type '{other}'"))),
    })
}

fn row_to_schedule(row: sqlx::sqlite::SqliteRow) -> Result<ReplicationSchedule, Error> {
    let schedule_type: String = row.try_get("schedule_type").map_err(db_err)?;
    Ok(ReplicationSchedule {
        schedule_id: row.try_get("schedule_id").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        cron_expression: row.try_get("cron_expression").map_err(db_err)?,
        schedule_type: str_sched_type(&schedule_type)?,
        enabled: row.try_get::<i64, _>("enabled").map_err(db_err)? != 0,
        retry_policy: RetryPolicy {
            max_attempts: row.try_get::<i64, _>("retry_max_attempts").map_err(db_err)? as u32,
            backoff_seconds: row.try_get::<i64, _>("retry_backoff_seconds").map_err(db_err)? as u64,
        },
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

pub async fn create_schedule(pool: &SqlitePool, s: &ReplicationSchedule) -> Result<(), Error> {
    sqlx::query(
        r#"INSERT INTO replication_schedules
           (schedule_id, name, cron_expression, schedule_type, enabled, retry_max_attempts,
            retry_backoff_seconds, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&s.schedule_id)
    .bind(&s.name)
    .bind(&s.cron_expression)
    .bind(sched_type_str(s.schedule_type))
    .bind(s.enabled as i64)
    .bind(s.retry_policy.max_attempts as i64)
    .bind(s.retry_policy.backoff_seconds as i64)
    .bind(s.created_at)
    .execute(pool)
    .await
    .map_err(|e| {
        if e.to_string().contains("UNIQUE") {
            Error::conflict(format!("schedule name '{}' already exists", s.name))
        } else {
            db_err(e)
        }
    })?;
    Ok(())
}

pub async fn list_enabled_schedules(pool: &SqlitePool) -> Result<Vec<ReplicationSchedule>, Error> {
    let rows = sqlx::query("SELECT * FROM replication_schedules WHERE enabled = 1")
        .fetch_all(pool)
        .await
        .map_err(db_err)?;
    rows.into_iter().map(row_to_schedule).collect()
}

pub async fn get_schedule(pool: &SqlitePool, schedule_id: &str) -> Result<ReplicationSchedule, Error> {
    let row = sqlx::query("SELECT * FROM replication_schedules WHERE schedule_id = ?")
        .bind(schedule_id)
        .fetch_optional(pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| Error::not_found(format!("schedule '{schedule_id}' not found")))?;
    row_to_schedule(row)
}

/// Aggregate stats over the trailing `window_days`, used by the management
/// surface's `GetScheduleStats` query.
pub async fn get_schedule_stats(pool: &SqlitePool, schedule_id: &str, window_days: i64) -> Result<ScheduleStats, Error> {
    let since = Utc::now() - chrono::Duration::days(window_days);
    let row = sqlx::query(
        r#"SELECT
             COUNT(*) as executions,
             COALESCE(SUM(jobs_created), 0) as jobs_created,
             COALESCE(SUM(jobs_completed), 0) as jobs_completed,
             COALESCE(SUM(jobs_failed), 0) as jobs_failed,
             COALESCE(SUM(jobs_skipped), 0) as jobs_skipped
           FROM schedule_executions WHERE schedule_id = ? AND scheduled_at >= ?"#,
    )
    .bind(schedule_id)
    .bind(since)
    .fetch_one(pool)
    .await
    .map_err(db_err)?;
    Ok(ScheduleStats {
        executions: row.try_get::<i64, _>("executions").map_err(db_err)?,
        jobs_created: row.try_get::<i64, _>("jobs_created").map_err(db_err)?,
        jobs_completed: row.try_get::<i64, _>("jobs_completed").map_err(db_err)?,
        jobs_failed: row.try_get::<i64, _>("jobs_failed").map_err(db_err)?,
        jobs_skipped: row.try_get::<i64, _>("jobs_skipped").map_err(db_err)?,
    })
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ScheduleStats {
    pub executions: i64,
    pub jobs_created: i64,
    pub jobs_completed: i64,
    pub jobs_failed: i64,
    pub jobs_skipped: i64,
}

// ---------------------------------------------------------------------
// VMMachineGroup
// ---------------------------------------------------------------------

fn row_to_group(row: sqlx::sqlite::SqliteRow) -> Result<VmMachineGroup, Error> {
    Ok(VmMachineGroup {
        group_id: row.try_get("group_id").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        schedule_id: row.try_get("schedule_id").map_err(db_err)?,
        max_concurrent_vms: row.try_get::<i64, _>("max_concurrent_vms").map_err(db_err)? as u32,
        priority: row.try_get::<i64, _>("priority").map_err(db_err)? as i32,
        created_by: row.try_get("created_by").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

pub async fn create_group(pool: &SqlitePool, g: &VmMachineGroup) -> Result<(), Error> {
    sqlx::query(
        r#"INSERT INTO vm_machine_groups
           (group_id, name, schedule_id, max_concurrent_vms, priority, created_by, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&g.group_id)
    .bind(&g.name)
    .bind(&g.schedule_id)
    .bind(g.max_concurrent_vms as i64)
    .bind(g.priority as i64)
    .bind(&g.created_by)
    .bind(g.created_at)
    .execute(pool)
    .await
    .map_err(|e| {
        if e.to_string().contains("UNIQUE") {
            Error::conflict(format!("group name '{}' already exists", g.name))
        } else {
            db_err(e)
        }
    })?;
    Ok(())
}

pub async fn list_groups(pool: &SqlitePool) -> Result<Vec<VmMachineGroup>, Error> {
    let rows = sqlx::query("SELECT * FROM vm_machine_groups ORDER BY created_at ASC")
        .fetch_all(pool)
        .await
        .map_err(db_err)?;
    rows.into_iter().map(row_to_group).collect()
}

pub async fn get_group(pool: &SqlitePool, group_id: &str) -> Result<VmMachineGroup, Error> {
    let row = sqlx::query("SELECT * FROM vm_machine_groups WHERE group_id = ?")
        .bind(group_id)
        .fetch_optional(pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| Error::not_found(format!("group '{group_id}' not found")))?;
    row_to_group(row)
}

pub async fn groups_for_schedule(pool: &SqlitePool, schedule_id: &str) -> Result<Vec<VmMachineGroup>, Error> {
    let rows = sqlx::query("SELECT * FROM vm_machine_groups WHERE schedule_id = ?")
        .bind(schedule_id)
        .fetch_all(pool)
        .await
        .map_err(db_err)?;
    rows.into_iter().map(row_to_group).collect()
}

pub async fn add_membership(pool: &SqlitePool, m: &VmGroupMembership) -> Result<(), Error> {
    sqlx::query(
        "INSERT INTO vm_group_memberships (group_id, context_id, priority, enabled, added_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&m.group_id)
    .bind(&m.context_id)
    .bind(m.priority as i64)
    .bind(m.enabled as i64)
    .bind(m.added_at)
    .execute(pool)
    .await
    .map_err(|e| {
        if e.to_string().contains("UNIQUE") || e.to_string().contains("PRIMARY KEY") {
            Error::conflict(format!("context '{}' already in group '{}'", m.context_id, m.group_id))
        } else {
            db_err(e)
        }
    })?;
    Ok(())
}

/// Enabled members of a group ordered for admission: `(priority asc, added_at asc)`
/// (spec §4.T1 expansion order).
pub async fn list_enabled_memberships(pool: &SqlitePool, group_id: &str) -> Result<Vec<VmGroupMembership>, Error> {
    let rows = sqlx::query(
        "SELECT * FROM vm_group_memberships WHERE group_id = ? AND enabled = 1 ORDER BY priority ASC, added_at ASC",
    )
    .bind(group_id)
    .fetch_all(pool)
    .await
    .map_err(db_err)?;
    rows.into_iter()
        .map(|row| {
            Ok(VmGroupMembership {
                group_id: row.try_get("group_id").map_err(db_err)?,
                context_id: row.try_get("context_id").map_err(db_err)?,
                priority: row.try_get::<i64, _>("priority").map_err(db_err)? as i32,
                enabled: row.try_get::<i64, _>("enabled").map_err(db_err)? != 0,
                added_at: row.try_get("added_at").map_err(db_err)?,
            })
        })
        .collect()
}

/// Count of non-terminal jobs currently outstanding for members of `group_id`,
/// used to enforce the per-group concurrency cap.
pub async fn count_running_jobs_for_group(pool: &SqlitePool, group_id: &str) -> Result<u32, Error> {
    let count: i64 = sqlx::query_scalar(
        r#"SELECT COUNT(*) FROM replication_jobs j
           JOIN vm_group_memberships m ON m.context_id = j.context_id
           WHERE m.group_id = ? AND j.status NOT IN ('completed', 'failed', 'cancelled')"#,
    )
    .bind(group_id)
    .fetch_one(pool)
    .await
    .map_err(db_err)?;
    Ok(count as u32)
}

// ---------------------------------------------------------------------
// ScheduleExecution
// ---------------------------------------------------------------------

fn exec_status_str(s: ExecutionStatus) -> &'static str {
    match s {
        ExecutionStatus::Pending => "pending",
        ExecutionStatus::Running => "running",
        ExecutionStatus::Completed => "completed",
        ExecutionStatus::Failed => "failed",
        ExecutionStatus::Skipped => "skipped",
    }
}

fn str_exec_status(s: &str) -> Result<ExecutionStatus, Error> {
    Ok(match s {
        "pending" => ExecutionStatus::Pending,
        "running" => ExecutionStatus::Running,
        "completed" => ExecutionStatus::Completed,
        "failed" => ExecutionStatus::Failed,
        "skipped" => ExecutionStatus::Skipped,
        other => return Err(Error::integrity(format!("unknown execution status '{other}'"))),
    })
}

fn row_to_execution(row: sqlx::sqlite::SqliteRow) -> Result<ScheduleExecution, Error> {
    let status: String = row.try_get("status").map_err(db_err)?;
    Ok(ScheduleExecution {
        execution_id: row.try_get("execution_id").map_err(db_err)?,
        schedule_id: row.try_get("schedule_id").map_err(db_err)?,
        group_id: row.try_get("group_id").map_err(db_err)?,
        scheduled_at: row.try_get("scheduled_at").map_err(db_err)?,
        started_at: row.try_get("started_at").map_err(db_err)?,
        completed_at: row.try_get("completed_at").map_err(db_err)?,
        status: str_exec_status(&status)?,
        jobs_created: row.try_get::<i64, _>("jobs_created").map_err(db_err)? as u32,
        jobs_completed: row.try_get::<i64, _>("jobs_completed").map_err(db_err)? as u32,
        jobs_failed: row.try_get::<i64, _>("jobs_failed").map_err(db_err)? as u32,
        jobs_skipped: row.try_get::<i64, _>("jobs_skipped").map_err(db_err)? as u32,
        duration_seconds: row.try_get("duration_seconds").map_err(db_err)?,
    })
}

pub async fn create_execution(pool: &SqlitePool, e: &ScheduleExecution) -> Result<(), Error> {
    sqlx::query(
        r#"INSERT INTO schedule_executions
           (execution_id, schedule_id, group_id, scheduled_at, started_at, completed_at, status,
            jobs_created, jobs_completed, jobs_failed, jobs_skipped, duration_seconds)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&e.execution_id)
    .bind(&e.schedule_id)
    .bind(&e.group_id)
    .bind(e.scheduled_at)
    .bind(e.started_at)
    .bind(e.completed_at)
    .bind(exec_status_str(e.status))
    .bind(e.jobs_created as i64)
    .bind(e.jobs_completed as i64)
    .bind(e.jobs_failed as i64)
    .bind(e.jobs_skipped as i64)
    .bind(e.duration_seconds)
    .execute(pool)
    .await
    .map_err(db_err)?;
    Ok(())
}

pub async fn get_execution(pool: &SqlitePool, execution_id: &str) -> Result<ScheduleExecution, Error> {
    let row = sqlx::query("SELECT * FROM schedule_executions WHERE execution_id = ?")
        .bind(execution_id)
        .fetch_optional(pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| Error::not_found(format!("schedule execution '{execution_id}' not found")))?;
    row_to_execution(row)
}

pub async fn set_execution_status(pool: &SqlitePool, execution_id: &str, status: ExecutionStatus) -> Result<(), Error> {
    let now = Utc::now();
    let (started_at, completed_at): (Option<DateTime<Utc>>, Option<DateTime<Utc>>) = match status {
        ExecutionStatus::Running => (Some(now), None),
        ExecutionStatus::Completed | ExecutionStatus::Failed => (None, Some(now)),
        _ => (None, None),
    };
    sqlx::query(
        r#"UPDATE schedule_executions
           SET status = ?, started_at = COALESCE(?, started_at), completed_at = COALESCE(?, completed_at)
           WHERE execution_id = ?"#,
    )
    .bind(exec_status_str(status))
    .bind(started_at)
    .bind(completed_at)
    .bind(execution_id)
    .execute(pool)
    .await
    .map_err(db_err)?;
    Ok(())
}

/// Atomic per-child-transition counter bump (spec §5: "execution counters
/// update atomically with the child transition they describe").
pub async fn increment_execution_counter(pool: &SqlitePool, execution_id: &str, field: ExecutionCounter) -> Result<(), Error> {
    let column = match field {
        ExecutionCounter::Created => "jobs_created",
        ExecutionCounter::Completed => "jobs_completed",
        ExecutionCounter::Failed => "jobs_failed",
        ExecutionCounter::Skipped => "jobs_skipped",
    };
    let sql = format!("UPDATE schedule_executions SET {column} = {column} + 1 WHERE execution_id = ?");
    sqlx::query(&sql)
        .bind(execution_id)
        .execute(pool)
        .await
        .map_err(db_err)?;
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub enum ExecutionCounter {
    Created,
    Completed,
    Failed,
    Skipped,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;
    use common::{ContextStatus, VmContext};

    #[tokio::test]
    async fn schedule_name_unique() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let s = ReplicationSchedule::new("nightly", "0 2 * * *");
        create_schedule(db.pool(), &s).await.unwrap();
        let dup = ReplicationSchedule::new("nightly", "0 3 * * *");
        let err = create_schedule(db.pool(), &dup).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn membership_ordering_by_priority_then_added_at() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let group = VmMachineGroup::new("g1", 2, "operator");
        create_group(db.pool(), &group).await.unwrap();

        for (ctx_id, priority) in [("ctx-b", 5), ("ctx-a", 1), ("ctx-c", 1)] {
            let ctx = VmContext::new("vc1", "dc1", ctx_id, "/p", ctx_id, "cred");
            crate::store::contexts::create(db.pool(), &ctx).await.unwrap();
            let membership = VmGroupMembership {
                group_id: group.group_id.clone(),
                context_id: ctx.context_id.clone(),
                priority,
                enabled: true,
                added_at: Utc::now(),
            };
            add_membership(db.pool(), &membership).await.unwrap();
        }

        let members = list_enabled_memberships(db.pool(), &group.group_id).await.unwrap();
        assert_eq!(members[0].priority, 1);
        assert_eq!(members[1].priority, 1);
        assert_eq!(members[2].priority, 5);
        let _ = ContextStatus::Discovered;
    }

    #[tokio::test]
    async fn execution_counters_increment_independently() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let exec = ScheduleExecution::new("sched-1", "group-1", Utc::now());
        create_execution(db.pool(), &exec).await.unwrap();
        increment_execution_counter(db.pool(), &exec.execution_id, ExecutionCounter::Created).await.unwrap();
        increment_execution_counter(db.pool(), &exec.execution_id, ExecutionCounter::Created).await.unwrap();
        increment_execution_counter(db.pool(), &exec.execution_id, ExecutionCounter::Skipped).await.unwrap();
        let fetched = get_execution(db.pool(), &exec.execution_id).await.unwrap();
        assert_eq!(fetched.jobs_created, 2);
        assert_eq!(fetched.jobs_skipped, 1);
        assert_eq!(fetched.jobs_completed, 0);
    }
}
