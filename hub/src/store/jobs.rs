//! Repositories for `ReplicationJob`, `VMDisk`, and `CBTHistoryEntry`.
//!
//! `ReplicationJob` rows are never mutated once `status` reaches a terminal
//! value (spec invariant); callers that attempt it get `Precondition` at the
//! orchestrator layer, not here — this layer only refuses to find the row.

use chrono::Utc;
use common::{CbtHistoryEntry, Error, JobStatus, JobType, ProvisioningType, ReplicationJob, VmDisk};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

fn job_type_str(t: JobType) -> &'static str {
    match t {
        JobType::Initial => "initial",
        JobType::Incremental => "incremental",
    }
}

fn str_job_type(s: &str) -> Result<JobType, Error> {
    Ok(match s {
        "initial" => JobType::Initial,
        "incremental" => JobType::Incremental,
        other => return Err(Error::integrity(format!("unknown job type '{other}'"))),
    })
}

fn job_status_str(s: JobStatus) -> &'static str {
    match s {
        JobStatus::Discovered => "discovered",
        JobStatus::Provisioning => "provisioning",
        JobStatus::Snapshotting => "snapshotting",
        JobStatus::Transferring => "transferring",
        JobStatus::Finalising => "finalising",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
        JobStatus::Cancelled => "cancelled",
    }
}

fn str_job_status(s: &str) -> Result<JobStatus, Error> {
    Ok(match s {
        "discovered" => JobStatus::Discovered,
        "provisioning" => JobStatus::Provisioning,
        "snapshotting" => JobStatus::Snapshotting,
        "transferring" => JobStatus::Transferring,
        "finalising" => JobStatus::Finalising,
        "completed" => JobStatus::Completed,
        "failed" => JobStatus::Failed,
        "cancelled" => JobStatus::Cancelled,
        other => return Err(Error::integrity(format!("unknown job status '{other}'"))),
    })
}

fn row_to_job(row: sqlx::sqlite::SqliteRow) -> Result<ReplicationJob, Error> {
    let job_type: String = row.try_get("job_type").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;
    let previous_change_ids: String = row.try_get("previous_change_ids").map_err(db_err)?;
    let previous_change_ids: HashMap<String, String> =
        serde_json::from_str(&previous_change_ids).map_err(|e| Error::integrity(e.to_string()))?;
    Ok(ReplicationJob {
        job_id: row.try_get("job_id").map_err(db_err)?,
        context_id: row.try_get("context_id").map_err(db_err)?,
        job_type: str_job_type(&job_type)?,
        status: str_job_status(&status)?,
        progress_percent: row.try_get("progress_percent").map_err(db_err)?,
        bytes_transferred: row.try_get::<i64, _>("bytes_transferred").map_err(db_err)? as u64,
        bytes_total: row.try_get::<i64, _>("bytes_total").map_err(db_err)? as u64,
        transfer_rate_mbps: row.try_get("transfer_rate_mbps").map_err(db_err)?,
        previous_change_ids,
        snapshot_ref: row.try_get("snapshot_ref").map_err(db_err)?,
        target_config_ref: row.try_get("target_config_ref").map_err(db_err)?,
        cancel_requested: row.try_get::<i64, _>("cancel_requested").map_err(db_err)? != 0,
        error: row.try_get("error").map_err(db_err)?,
        started_at: row.try_get("started_at").map_err(db_err)?,
        completed_at: row.try_get("completed_at").map_err(db_err)?,
        execution_id: row.try_get("execution_id").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn db_err(e: sqlx::Error) -> Error {
    Error::unavailable(e.to_string())
}

pub async fn create(pool: &SqlitePool, job: &ReplicationJob) -> Result<(), Error> {
    let previous_change_ids =
        serde_json::to_string(&job.previous_change_ids).map_err(|e| Error::fatal(e.to_string()))?;
    sqlx::query(
        r#"INSERT INTO replication_jobs
           (job_id, context_id, job_type, status, progress_percent, bytes_transferred,
            bytes_total, transfer_rate_mbps, previous_change_ids, snapshot_ref, target_config_ref,
            cancel_requested, error, started_at, completed_at, execution_id, created_at, updated_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&job.job_id)
    .bind(&job.context_id)
    .bind(job_type_str(job.job_type))
    .bind(job_status_str(job.status))
    .bind(job.progress_percent)
    .bind(job.bytes_transferred as i64)
    .bind(job.bytes_total as i64)
    .bind(job.transfer_rate_mbps)
    .bind(previous_change_ids)
    .bind(&job.snapshot_ref)
    .bind(&job.target_config_ref)
    .bind(job.cancel_requested as i64)
    .bind(&job.error)
    .bind(job.started_at)
    .bind(job.completed_at)
    .bind(&job.execution_id)
    .bind(job.created_at)
    .bind(job.updated_at)
    .execute(pool)
    .await
    .map_err(db_err)?;
    Ok(())
}

/// Links a job to the `ScheduleExecution` that emitted it. Called once right
/// after the scheduler admits the job, so the orchestrator's terminal
/// transition can find the execution to update.
pub async fn set_execution_id(pool: &SqlitePool, job_id: &str, execution_id: &str) -> Result<(), Error> {
    let result = sqlx::query("UPDATE replication_jobs SET execution_id = ?, updated_at = ? WHERE job_id = ?")
        .bind(execution_id)
        .bind(Utc::now())
        .bind(job_id)
        .execute(pool)
        .await
        .map_err(db_err)?;
    if result.rows_affected() == 0 {
        return Err(Error::not_found(format!("job '{job_id}' not found")));
    }
    Ok(())
}

pub async fn get(pool: &SqlitePool, job_id: &str) -> Result<ReplicationJob, Error> {
    let row = sqlx::query("SELECT * FROM replication_jobs WHERE job_id = ?")
        .bind(job_id)
        .fetch_optional(pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| Error::not_found(format!("job '{job_id}' not found")))?;
    row_to_job(row)
}

pub async fn list_for_context(pool: &SqlitePool, context_id: &str) -> Result<Vec<ReplicationJob>, Error> {
    let rows = sqlx::query("SELECT * FROM replication_jobs WHERE context_id = ? ORDER BY created_at ASC")
        .bind(context_id)
        .fetch_all(pool)
        .await
        .map_err(db_err)?;
    rows.into_iter().map(row_to_job).collect()
}

/// The most recent `completed` job for `(context_id, disk_id)`, used to seed
/// `previous_change_id` for the next incremental run.
pub async fn last_completed_change_id(
    pool: &SqlitePool,
    context_id: &str,
    disk_id: &str,
) -> Result<Option<String>, Error> {
    let rows = sqlx::query(
        r#"SELECT j.job_id, c.change_id, j.completed_at FROM replication_jobs j
           JOIN cbt_history c ON c.job_id = j.job_id
           WHERE j.context_id = ? AND c.disk_id = ? AND j.status = 'completed'
           ORDER BY j.completed_at DESC LIMIT 1"#,
    )
    .bind(context_id)
    .bind(disk_id)
    .fetch_optional(pool)
    .await
    .map_err(db_err)?;
    Ok(match rows {
        Some(row) => Some(row.try_get("change_id").map_err(db_err)?),
        None => None,
    })
}

pub async fn update_status(
    pool: &SqlitePool,
    job_id: &str,
    status: JobStatus,
    error: Option<&str>,
) -> Result<(), Error> {
    let now = Utc::now();
    let completed_at = if status.is_terminal() { Some(now) } else { None };
    let result = sqlx::query(
        "UPDATE replication_jobs SET status = ?, error = ?, completed_at = COALESCE(completed_at, ?), updated_at = ? WHERE job_id = ?",
    )
    .bind(job_status_str(status))
    .bind(error)
    .bind(completed_at)
    .bind(now)
    .bind(job_id)
    .execute(pool)
    .await
    .map_err(db_err)?;
    if result.rows_affected() == 0 {
        return Err(Error::not_found(format!("job '{job_id}' not found")));
    }
    Ok(())
}

/// Progress must be monotonically non-decreasing within a run (spec
/// invariant); enforced here so every caller benefits, not just the mover
/// supervisor.
pub async fn update_progress(
    pool: &SqlitePool,
    job_id: &str,
    percent: f64,
    bytes_transferred: u64,
    bytes_total: u64,
    throughput_mbps: f64,
) -> Result<(), Error> {
    let result = sqlx::query(
        r#"UPDATE replication_jobs
           SET progress_percent = MAX(progress_percent, ?),
               bytes_transferred = MAX(bytes_transferred, ?),
               bytes_total = ?,
               transfer_rate_mbps = ?,
               updated_at = ?
           WHERE job_id = ?"#,
    )
    .bind(percent)
    .bind(bytes_transferred as i64)
    .bind(bytes_total as i64)
    .bind(throughput_mbps)
    .bind(Utc::now())
    .bind(job_id)
    .execute(pool)
    .await
    .map_err(db_err)?;
    if result.rows_affected() == 0 {
        return Err(Error::not_found(format!("job '{job_id}' not found")));
    }
    Ok(())
}

pub async fn set_snapshot_ref(pool: &SqlitePool, job_id: &str, snapshot_ref: Option<&str>) -> Result<(), Error> {
    sqlx::query("UPDATE replication_jobs SET snapshot_ref = ?, updated_at = ? WHERE job_id = ?")
        .bind(snapshot_ref)
        .bind(Utc::now())
        .bind(job_id)
        .execute(pool)
        .await
        .map_err(db_err)?;
    Ok(())
}

pub async fn set_cancel_requested(pool: &SqlitePool, job_id: &str) -> Result<(), Error> {
    let result = sqlx::query("UPDATE replication_jobs SET cancel_requested = 1, updated_at = ? WHERE job_id = ? AND status NOT IN ('completed', 'failed', 'cancelled')")
        .bind(Utc::now())
        .bind(job_id)
        .execute(pool)
        .await
        .map_err(db_err)?;
    if result.rows_affected() == 0 {
        return Err(Error::precondition(format!("job '{job_id}' is not cancellable")));
    }
    Ok(())
}

// ---------------------------------------------------------------------
// VMDisk
// ---------------------------------------------------------------------

fn provisioning_str(p: ProvisioningType) -> &'static str {
    match p {
        ProvisioningType::Thin => "thin",
        ProvisioningType::Thick => "thick",
    }
}

fn str_provisioning(s: &str) -> Result<ProvisioningType, Error> {
    Ok(match s {
        "thin" => ProvisioningType::Thin,
        "thick" => ProvisioningType::Thick,
        other => return Err(Error::integrity(format!("unknown provisioning type '{other}'"))),
    })
}

fn row_to_disk(row: sqlx::sqlite::SqliteRow) -> Result<VmDisk, Error> {
    let provisioning: String = row.try_get("provisioning_type").map_err(db_err)?;
    Ok(VmDisk {
        disk_id: row.try_get("disk_id").map_err(db_err)?,
        job_id: row.try_get("job_id").map_err(db_err)?,
        source_disk_id: row.try_get("source_disk_id").map_err(db_err)?,
        vmdk_path: row.try_get("vmdk_path").map_err(db_err)?,
        size_gb: row.try_get::<i64, _>("size_gb").map_err(db_err)? as u64,
        capacity_bytes: row.try_get::<i64, _>("capacity_bytes").map_err(db_err)? as u64,
        datastore: row.try_get("datastore").map_err(db_err)?,
        unit_number: row.try_get::<i64, _>("unit_number").map_err(db_err)? as u32,
        provisioning_type: str_provisioning(&provisioning)?,
        ossea_volume_id: row.try_get("ossea_volume_id").map_err(db_err)?,
        disk_change_id: row.try_get("disk_change_id").map_err(db_err)?,
        progress_percent: row.try_get("progress_percent").map_err(db_err)?,
    })
}

pub async fn create_disk(pool: &SqlitePool, disk: &VmDisk) -> Result<(), Error> {
    sqlx::query(
        r#"INSERT INTO vm_disks
           (disk_id, job_id, source_disk_id, vmdk_path, size_gb, capacity_bytes, datastore,
            unit_number, provisioning_type, ossea_volume_id, disk_change_id, progress_percent)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&disk.disk_id)
    .bind(&disk.job_id)
    .bind(&disk.source_disk_id)
    .bind(&disk.vmdk_path)
    .bind(disk.size_gb as i64)
    .bind(disk.capacity_bytes as i64)
    .bind(&disk.datastore)
    .bind(disk.unit_number as i64)
    .bind(provisioning_str(disk.provisioning_type))
    .bind(&disk.ossea_volume_id)
    .bind(&disk.disk_change_id)
    .bind(disk.progress_percent)
    .execute(pool)
    .await
    .map_err(db_err)?;
    Ok(())
}

pub async fn list_disks_for_job(pool: &SqlitePool, job_id: &str) -> Result<Vec<VmDisk>, Error> {
    let rows = sqlx::query("SELECT * FROM vm_disks WHERE job_id = ? ORDER BY unit_number ASC")
        .bind(job_id)
        .fetch_all(pool)
        .await
        .map_err(db_err)?;
    rows.into_iter().map(row_to_disk).collect()
}

pub async fn assign_volume(pool: &SqlitePool, disk_id: &str, volume_id: &str) -> Result<(), Error> {
    let result = sqlx::query("UPDATE vm_disks SET ossea_volume_id = ? WHERE disk_id = ?")
        .bind(volume_id)
        .bind(disk_id)
        .execute(pool)
        .await
        .map_err(db_err)?;
    if result.rows_affected() == 0 {
        return Err(Error::not_found(format!("disk '{disk_id}' not found")));
    }
    Ok(())
}

pub async fn update_disk_progress(
    pool: &SqlitePool,
    disk_id: &str,
    percent: f64,
    change_id: Option<&str>,
) -> Result<(), Error> {
    sqlx::query(
        "UPDATE vm_disks SET progress_percent = MAX(progress_percent, ?), disk_change_id = COALESCE(?, disk_change_id) WHERE disk_id = ?",
    )
    .bind(percent)
    .bind(change_id)
    .bind(disk_id)
    .execute(pool)
    .await
    .map_err(db_err)?;
    Ok(())
}

// ---------------------------------------------------------------------
// CBTHistoryEntry
// ---------------------------------------------------------------------

pub async fn record_cbt(pool: &SqlitePool, entry: &CbtHistoryEntry) -> Result<(), Error> {
    sqlx::query(
        r#"INSERT INTO cbt_history
           (job_id, disk_id, change_id, sync_type, blocks_changed, bytes_transferred,
            duration_seconds, success, recorded_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&entry.job_id)
    .bind(&entry.disk_id)
    .bind(&entry.change_id)
    .bind(job_type_str(entry.sync_type))
    .bind(entry.blocks_changed as i64)
    .bind(entry.bytes_transferred as i64)
    .bind(entry.duration_seconds)
    .bind(entry.success as i64)
    .bind(entry.recorded_at)
    .execute(pool)
    .await
    .map_err(|e| {
        if e.to_string().contains("UNIQUE") {
            Error::conflict(format!(
                "CBT history row ({}, {}, {}) already recorded",
                entry.job_id, entry.disk_id, entry.change_id
            ))
        } else {
            db_err(e)
        }
    })?;
    Ok(())
}

pub async fn list_cbt_for_job(pool: &SqlitePool, job_id: &str) -> Result<Vec<CbtHistoryEntry>, Error> {
    let rows = sqlx::query("SELECT * FROM cbt_history WHERE job_id = ? ORDER BY recorded_at ASC")
        .bind(job_id)
        .fetch_all(pool)
        .await
        .map_err(db_err)?;
    rows.into_iter()
        .map(|row| {
            let sync_type: String = row.try_get("sync_type").map_err(db_err)?;
            Ok(CbtHistoryEntry {
                job_id: row.try_get("job_id").map_err(db_err)?,
                disk_id: row.try_get("disk_id").map_err(db_err)?,
                change_id: row.try_get("change_id").map_err(db_err)?,
                sync_type: str_job_type(&sync_type)?,
                blocks_changed: row.try_get::<i64, _>("blocks_changed").map_err(db_err)? as u64,
                bytes_transferred: row.try_get::<i64, _>("bytes_transferred").map_err(db_err)? as u64,
                duration_seconds: row.try_get("duration_seconds").map_err(db_err)?,
                success: row.try_get::<i64, _>("success").map_err(db_err)? != 0,
                recorded_at: row.try_get("recorded_at").map_err(db_err)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;

    #[tokio::test]
    async fn create_and_get_job_roundtrip() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let job = ReplicationJob::new("ctx-1", JobType::Initial);
        create(db.pool(), &job).await.unwrap();
        let fetched = get(db.pool(), &job.job_id).await.unwrap();
        assert_eq!(fetched.status, JobStatus::Discovered);
        assert_eq!(fetched.job_type, JobType::Initial);
    }

    #[tokio::test]
    async fn progress_never_regresses() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let job = ReplicationJob::new("ctx-1", JobType::Initial);
        create(db.pool(), &job).await.unwrap();
        update_progress(db.pool(), &job.job_id, 50.0, 500, 1000, 10.0).await.unwrap();
        update_progress(db.pool(), &job.job_id, 20.0, 100, 1000, 5.0).await.unwrap();
        let fetched = get(db.pool(), &job.job_id).await.unwrap();
        assert_eq!(fetched.progress_percent, 50.0);
        assert_eq!(fetched.bytes_transferred, 500);
    }

    #[tokio::test]
    async fn cbt_history_unique_triple() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let job = ReplicationJob::new("ctx-1", JobType::Initial);
        create(db.pool(), &job).await.unwrap();
        let entry = CbtHistoryEntry {
            job_id: job.job_id.clone(),
            disk_id: "disk-1".into(),
            change_id: "cA0".into(),
            sync_type: JobType::Initial,
            blocks_changed: 10,
            bytes_transferred: 4096,
            duration_seconds: 1.5,
            success: true,
            recorded_at: Utc::now(),
        };
        record_cbt(db.pool(), &entry).await.unwrap();
        let err = record_cbt(db.pool(), &entry).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }
}
