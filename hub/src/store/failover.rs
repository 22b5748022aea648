//! Repository for `FailoverJob` and its phase-progress rows.
//!
//! A phase is marked complete and the job's `current_phase` advanced in the
//! same transaction (`advance_phase`), so a crash between the two can never
//! happen: on restart the engine resumes from `current_phase`, and
//! `list_phase_progress` gives it the full history of what already ran
//! (spec §4.M3's "persisted phase-progress rows").

use chrono::Utc;
use common::{Error, FailoverJob, FailoverMode, FailoverPhase, FailoverPhaseProgress, FailoverStatus, RollbackOptions};
use sqlx::{Row, SqlitePool};

fn db_err(e: sqlx::Error) -> Error {
    Error::unavailable(e.to_string())
}

fn mode_str(m: FailoverMode) -> &'static str {
    match m {
        FailoverMode::Test => "test",
        FailoverMode::Live => "live",
    }
}

fn str_mode(s: &str) -> Result<FailoverMode, Error> {
    Ok(match s {
        "test" => FailoverMode::Test,
        "live" => FailoverMode::Live,
        other => return Err(Error::integrity(format!("unknown failover mode '{other}'"))),
    })
}

fn status_str(s: FailoverStatus) -> &'static str {
    match s {
        FailoverStatus::Running => "running",
        FailoverStatus::Completed => "completed",
        FailoverStatus::Failed => "failed",
        FailoverStatus::RollingBack => "rolling_back",
        FailoverStatus::RolledBack => "rolled_back",
        FailoverStatus::RollbackFailed => "rollback_failed",
    }
}

fn str_status(s: &str) -> Result<FailoverStatus, Error> {
    Ok(match s {
        "running" => FailoverStatus::Running,
        "completed" => FailoverStatus::Completed,
        "failed" => FailoverStatus::Failed,
        "rolling_back" => FailoverStatus::RollingBack,
        "rolled_back" => FailoverStatus::RolledBack,
        "rollback_failed" => FailoverStatus::RollbackFailed,
        other => return Err(Error::integrity(format!("unknown failover status '{other}'"))),
    })
}

pub(crate) fn phase_str(p: FailoverPhase) -> &'static str {
    match p {
        FailoverPhase::PreflightValidation => "preflight_validation",
        FailoverPhase::SourceQuiesce => "source_quiesce",
        FailoverPhase::FinalDeltaSync => "final_delta_sync",
        FailoverPhase::SnapshotTargetVolumes => "snapshot_target_volumes",
        FailoverPhase::CreateTargetVm => "create_target_vm",
        FailoverPhase::PowerOnTarget => "power_on_target",
        FailoverPhase::Finalise => "finalise",
    }
}

fn str_phase(s: &str) -> Result<FailoverPhase, Error> {
    Ok(match s {
        "preflight_validation" => FailoverPhase::PreflightValidation,
        "source_quiesce" => FailoverPhase::SourceQuiesce,
        "final_delta_sync" => FailoverPhase::FinalDeltaSync,
        "snapshot_target_volumes" => FailoverPhase::SnapshotTargetVolumes,
        "create_target_vm" => FailoverPhase::CreateTargetVm,
        "power_on_target" => FailoverPhase::PowerOnTarget,
        "finalise" => FailoverPhase::Finalise,
        other => return Err(Error::integrity(format!("unknown failover phase '{other}'"))),
    })
}

fn row_to_job(row: sqlx::sqlite::SqliteRow) -> Result<FailoverJob, Error> {
    let mode: String = row.try_get("mode").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;
    let phase: String = row.try_get("current_phase").map_err(db_err)?;
    let rollback_options: Option<String> = row.try_get("rollback_options").map_err(db_err)?;
    let rollback_options = rollback_options
        .map(|json| serde_json::from_str::<RollbackOptions>(&json).map_err(|e| Error::integrity(e.to_string())))
        .transpose()?;
    Ok(FailoverJob {
        failover_id: row.try_get("failover_id").map_err(db_err)?,
        context_id: row.try_get("context_id").map_err(db_err)?,
        mode: str_mode(&mode)?,
        status: str_status(&status)?,
        current_phase: str_phase(&phase)?,
        target_vm_id: row.try_get("target_vm_id").map_err(db_err)?,
        rollback_of: row.try_get("rollback_of").map_err(db_err)?,
        rollback_options,
        reason: row.try_get("reason").map_err(db_err)?,
        error: row.try_get("error").map_err(db_err)?,
        started_at: row.try_get("started_at").map_err(db_err)?,
        completed_at: row.try_get("completed_at").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

pub async fn create(pool: &SqlitePool, job: &FailoverJob) -> Result<(), Error> {
    let rollback_options = job
        .rollback_options
        .map(|opts| serde_json::to_string(&opts))
        .transpose()
        .map_err(|e| Error::fatal(e.to_string()))?;
    sqlx::query(
        r#"INSERT INTO failover_jobs
           (failover_id, context_id, mode, status, current_phase, target_vm_id, rollback_of,
            rollback_options, reason, error, started_at, completed_at, created_at, updated_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&job.failover_id)
    .bind(&job.context_id)
    .bind(mode_str(job.mode))
    .bind(status_str(job.status))
    .bind(phase_str(job.current_phase))
    .bind(&job.target_vm_id)
    .bind(&job.rollback_of)
    .bind(rollback_options)
    .bind(&job.reason)
    .bind(&job.error)
    .bind(job.started_at)
    .bind(job.completed_at)
    .bind(job.created_at)
    .bind(job.updated_at)
    .execute(pool)
    .await
    .map_err(db_err)?;
    Ok(())
}

pub async fn get(pool: &SqlitePool, failover_id: &str) -> Result<FailoverJob, Error> {
    let row = sqlx::query("SELECT * FROM failover_jobs WHERE failover_id = ?")
        .bind(failover_id)
        .fetch_optional(pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| Error::not_found(format!("failover job '{failover_id}' not found")))?;
    row_to_job(row)
}

pub async fn list_for_context(pool: &SqlitePool, context_id: &str) -> Result<Vec<FailoverJob>, Error> {
    let rows = sqlx::query("SELECT * FROM failover_jobs WHERE context_id = ? ORDER BY created_at ASC")
        .bind(context_id)
        .fetch_all(pool)
        .await
        .map_err(db_err)?;
    rows.into_iter().map(row_to_job).collect()
}

/// Any non-terminal failover or rollback against `context_id` — the
/// "source conflict" the scheduler's admission rule 3 checks, and what
/// pre-flight validation refuses to run alongside (spec §4.M3, §4.T1).
pub async fn find_active_for_context(pool: &SqlitePool, context_id: &str) -> Result<Option<FailoverJob>, Error> {
    let row = sqlx::query(
        r#"SELECT * FROM failover_jobs
           WHERE context_id = ? AND status IN ('running', 'rolling_back')
           ORDER BY created_at DESC LIMIT 1"#,
    )
    .bind(context_id)
    .fetch_optional(pool)
    .await
    .map_err(db_err)?;
    row.map(row_to_job).transpose()
}

pub async fn set_status(pool: &SqlitePool, failover_id: &str, status: FailoverStatus, error: Option<&str>) -> Result<(), Error> {
    let now = Utc::now();
    let completed_at = if status.is_terminal() { Some(now) } else { None };
    let result = sqlx::query(
        "UPDATE failover_jobs SET status = ?, error = ?, completed_at = COALESCE(completed_at, ?), updated_at = ? WHERE failover_id = ?",
    )
    .bind(status_str(status))
    .bind(error)
    .bind(completed_at)
    .bind(now)
    .bind(failover_id)
    .execute(pool)
    .await
    .map_err(db_err)?;
    if result.rows_affected() == 0 {
        return Err(Error::not_found(format!("failover job '{failover_id}' not found")));
    }
    Ok(())
}

pub async fn set_target_vm(pool: &SqlitePool, failover_id: &str, target_vm_id: &str) -> Result<(), Error> {
    sqlx::query("UPDATE failover_jobs SET target_vm_id = ?, updated_at = ? WHERE failover_id = ?")
        .bind(target_vm_id)
        .bind(Utc::now())
        .bind(failover_id)
        .execute(pool)
        .await
        .map_err(db_err)?;
    Ok(())
}

/// Records `phase` as complete and moves `current_phase` to the next one in
/// a single transaction — the unit a crash can never observe half of.
pub async fn advance_phase(pool: &SqlitePool, failover_id: &str, phase: FailoverPhase) -> Result<(), Error> {
    let now = Utc::now();
    let next = phase.next().unwrap_or(phase);
    let mut tx = pool.begin().await.map_err(db_err)?;
    sqlx::query("INSERT OR IGNORE INTO failover_phase_progress (failover_id, phase, completed_at) VALUES (?, ?, ?)")
        .bind(failover_id)
        .bind(phase_str(phase))
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
    let result = sqlx::query("UPDATE failover_jobs SET current_phase = ?, updated_at = ? WHERE failover_id = ?")
        .bind(phase_str(next))
        .bind(now)
        .bind(failover_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
    if result.rows_affected() == 0 {
        return Err(Error::not_found(format!("failover job '{failover_id}' not found")));
    }
    tx.commit().await.map_err(db_err)?;
    Ok(())
}

/// The phases already completed for `failover_id`, in execution order —
/// what a crash-resumed run consults to skip re-doing idempotent work it
/// already finished.
pub async fn list_phase_progress(pool: &SqlitePool, failover_id: &str) -> Result<Vec<FailoverPhaseProgress>, Error> {
    let rows = sqlx::query("SELECT * FROM failover_phase_progress WHERE failover_id = ? ORDER BY completed_at ASC")
        .bind(failover_id)
        .fetch_all(pool)
        .await
        .map_err(db_err)?;
    rows.into_iter()
        .map(|row| {
            let phase: String = row.try_get("phase").map_err(db_err)?;
            Ok(FailoverPhaseProgress {
                failover_id: row.try_get("failover_id").map_err(db_err)?,
                phase: str_phase(&phase)?,
                completed_at: row.try_get("completed_at").map_err(db_err)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;

    #[tokio::test]
    async fn create_and_get_roundtrip() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let job = FailoverJob::new("ctx-1", FailoverMode::Test, Some("scheduled DR test".into()));
        create(db.pool(), &job).await.unwrap();
        let fetched = get(db.pool(), &job.failover_id).await.unwrap();
        assert_eq!(fetched.status, FailoverStatus::Running);
        assert_eq!(fetched.current_phase, FailoverPhase::PreflightValidation);
    }

    #[tokio::test]
    async fn advance_phase_records_progress_and_moves_current() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let job = FailoverJob::new("ctx-1", FailoverMode::Live, None);
        create(db.pool(), &job).await.unwrap();

        advance_phase(db.pool(), &job.failover_id, FailoverPhase::PreflightValidation).await.unwrap();
        let fetched = get(db.pool(), &job.failover_id).await.unwrap();
        assert_eq!(fetched.current_phase, FailoverPhase::SourceQuiesce);

        let progress = list_phase_progress(db.pool(), &job.failover_id).await.unwrap();
        assert_eq!(progress.len(), 1);
        assert_eq!(progress[0].phase, FailoverPhase::PreflightValidation);
    }

    #[tokio::test]
    async fn find_active_for_context_ignores_terminal_jobs() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let job = FailoverJob::new("ctx-1", FailoverMode::Test, None);
        create(db.pool(), &job).await.unwrap();
        assert!(find_active_for_context(db.pool(), "ctx-1").await.unwrap().is_some());

        set_status(db.pool(), &job.failover_id, FailoverStatus::Completed, None).await.unwrap();
        assert!(find_active_for_context(db.pool(), "ctx-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rollback_job_links_to_original() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let original = FailoverJob::new("ctx-1", FailoverMode::Test, None);
        create(db.pool(), &original).await.unwrap();
        let rollback = FailoverJob::new_rollback(
            &original,
            RollbackOptions { power_on_source_vm: true, force_cleanup: true, failover_type: FailoverMode::Test },
            Some("operator requested revert".into()),
        );
        create(db.pool(), &rollback).await.unwrap();
        let fetched = get(db.pool(), &rollback.failover_id).await.unwrap();
        assert_eq!(fetched.rollback_of.as_deref(), Some(original.failover_id.as_str()));
        assert_eq!(fetched.status, FailoverStatus::RollingBack);
    }
}
