//! Repository for `VMContext`, including the CAS on `current_job_id` that
//! enforces "at most one non-terminal job per context" (spec invariant).

use chrono::{DateTime, Utc};
use common::{ContextStatus, Error, VmContext};
use sqlx::{Row, SqlitePool};

fn status_to_str(s: ContextStatus) -> &'static str {
    match s {
        ContextStatus::Discovered => "discovered",
        ContextStatus::Provisioning => "provisioning",
        ContextStatus::Snapshotting => "snapshotting",
        ContextStatus::Transferring => "transferring",
        ContextStatus::Finalising => "finalising",
        ContextStatus::Ready => "ready",
        ContextStatus::FailedOverTest => "failed_over_test",
        ContextStatus::FailedOverLive => "failed_over_live",
        ContextStatus::Failed => "failed",
    }
}

fn str_to_status(s: &str) -> Result<ContextStatus, Error> {
    Ok(match s {
        "discovered" => ContextStatus::Discovered,
        "provisioning" => ContextStatus::Provisioning,
        "snapshotting" => ContextStatus::Snapshotting,
        "transferring" => ContextStatus::Transferring,
        "finalising" => ContextStatus::Finalising,
        "ready" => ContextStatus::Ready,
        "failed_over_test" => ContextStatus::FailedOverTest,
        "failed_over_live" => ContextStatus::FailedOverLive,
        "failed" => ContextStatus::Failed,
        other => return Err(Error::integrity(format!("unknown context status '{other}'"))),
    })
}

fn row_to_context(row: sqlx::sqlite::SqliteRow) -> Result<VmContext, Error> {
    let status: String = row.try_get("current_status").map_err(|e| Error::unavailable(e.to_string()))?;
    Ok(VmContext {
        context_id: row.try_get("context_id").map_err(|e| Error::unavailable(e.to_string()))?,
        vcenter_host: row.try_get("vcenter_host").map_err(|e| Error::unavailable(e.to_string()))?,
        datacenter: row.try_get("datacenter").map_err(|e| Error::unavailable(e.to_string()))?,
        moref: row.try_get("moref").map_err(|e| Error::unavailable(e.to_string()))?,
        path: row.try_get("path").map_err(|e| Error::unavailable(e.to_string()))?,
        display_name: row.try_get("display_name").map_err(|e| Error::unavailable(e.to_string()))?,
        cpu_count: row.try_get::<i64, _>("cpu_count").map_err(|e| Error::unavailable(e.to_string()))? as u32,
        memory_mb: row.try_get::<i64, _>("memory_mb").map_err(|e| Error::unavailable(e.to_string()))? as u64,
        os_family: row.try_get("os_family").map_err(|e| Error::unavailable(e.to_string()))?,
        power_state: row.try_get("power_state").map_err(|e| Error::unavailable(e.to_string()))?,
        discovered_at: row.try_get("discovered_at").map_err(|e| Error::unavailable(e.to_string()))?,
        current_status: str_to_status(&status)?,
        current_job_id: row.try_get("current_job_id").map_err(|e| Error::unavailable(e.to_string()))?,
        auto_added: row.try_get::<i64, _>("auto_added").map_err(|e| Error::unavailable(e.to_string()))? != 0,
        scheduler_enabled: row.try_get::<i64, _>("scheduler_enabled").map_err(|e| Error::unavailable(e.to_string()))? != 0,
        credential_id: row.try_get("credential_id").map_err(|e| Error::unavailable(e.to_string()))?,
        version: row.try_get("version").map_err(|e| Error::unavailable(e.to_string()))?,
        created_at: row.try_get("created_at").map_err(|e| Error::unavailable(e.to_string()))?,
        updated_at: row.try_get("updated_at").map_err(|e| Error::unavailable(e.to_string()))?,
    })
}

pub async fn create(pool: &SqlitePool, ctx: &VmContext) -> Result<(), Error> {
    sqlx::query(
        r#"INSERT INTO vm_contexts
           (context_id, vcenter_host, datacenter, moref, path, display_name, cpu_count,
            memory_mb, os_family, power_state, discovered_at, current_status, current_job_id,
            auto_added, scheduler_enabled, credential_id, version, created_at, updated_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&ctx.context_id)
    .bind(&ctx.vcenter_host)
    .bind(&ctx.datacenter)
    .bind(&ctx.moref)
    .bind(&ctx.path)
    .bind(&ctx.display_name)
    .bind(ctx.cpu_count as i64)
    .bind(ctx.memory_mb as i64)
    .bind(&ctx.os_family)
    .bind(&ctx.power_state)
    .bind(ctx.discovered_at)
    .bind(status_to_str(ctx.current_status))
    .bind(&ctx.current_job_id)
    .bind(ctx.auto_added as i64)
    .bind(ctx.scheduler_enabled as i64)
    .bind(&ctx.credential_id)
    .bind(ctx.version)
    .bind(ctx.created_at)
    .bind(ctx.updated_at)
    .execute(pool)
    .await
    .map_err(|e| {
        if e.to_string().contains("UNIQUE") {
            Error::conflict(format!("context for ({}, {}) already exists", ctx.vcenter_host, ctx.display_name))
        } else {
            Error::unavailable(e.to_string())
        }
    })?;
    Ok(())
}

pub async fn get(pool: &SqlitePool, context_id: &str) -> Result<VmContext, Error> {
    let row = sqlx::query("SELECT * FROM vm_contexts WHERE context_id = ?")
        .bind(context_id)
        .fetch_optional(pool)
        .await
        .map_err(|e| Error::unavailable(e.to_string()))?
        .ok_or_else(|| Error::not_found(format!("context '{context_id}' not found")))?;
    row_to_context(row)
}

pub async fn list(pool: &SqlitePool) -> Result<Vec<VmContext>, Error> {
    let rows = sqlx::query("SELECT * FROM vm_contexts ORDER BY created_at ASC")
        .fetch_all(pool)
        .await
        .map_err(|e| Error::unavailable(e.to_string()))?;
    rows.into_iter().map(row_to_context).collect()
}

/// VMs discovered but never placed into a protection group (used by the
/// ungrouped-VMs listing that the scheduler's admission logic, and the
/// management surface, both read).
pub async fn list_ungrouped(pool: &SqlitePool) -> Result<Vec<VmContext>, Error> {
    let rows = sqlx::query(
        r#"SELECT c.* FROM vm_contexts c
           LEFT JOIN vm_group_memberships m ON m.context_id = c.context_id
           WHERE m.context_id IS NULL
           ORDER BY c.created_at ASC"#,
    )
    .fetch_all(pool)
    .await
    .map_err(|e| Error::unavailable(e.to_string()))?;
    rows.into_iter().map(row_to_context).collect()
}

pub async fn delete(pool: &SqlitePool, context_id: &str) -> Result<(), Error> {
    let result = sqlx::query("DELETE FROM vm_contexts WHERE context_id = ?")
        .bind(context_id)
        .execute(pool)
        .await
        .map_err(|e| Error::unavailable(e.to_string()))?;
    if result.rows_affected() == 0 {
        return Err(Error::not_found(format!("context '{context_id}' not found")));
    }
    Ok(())
}

pub async fn update_status(pool: &SqlitePool, context_id: &str, status: ContextStatus) -> Result<(), Error> {
    let result = sqlx::query(
        "UPDATE vm_contexts SET current_status = ?, updated_at = ? WHERE context_id = ?",
    )
    .bind(status_to_str(status))
    .bind(Utc::now())
    .bind(context_id)
    .execute(pool)
    .await
    .map_err(|e| Error::unavailable(e.to_string()))?;
    if result.rows_affected() == 0 {
        return Err(Error::not_found(format!("context '{context_id}' not found")));
    }
    Ok(())
}

/// Compare-and-set `current_job_id`. `expected_job_id` must match the row's
/// current value (by equality, `None == NULL`) and `expected_version` must
/// match the row's version; on success the version is bumped by one. A
/// mismatch on either axis surfaces `Conflict` — this is the sole
/// concurrency gate that makes "at most one non-terminal job per context" a
/// property of the store rather than of caller discipline.
pub async fn cas_current_job(
    pool: &SqlitePool,
    context_id: &str,
    expected_job_id: Option<&str>,
    expected_version: i64,
    new_job_id: Option<&str>,
) -> Result<(), Error> {
    let result = sqlx::query(
        r#"UPDATE vm_contexts
           SET current_job_id = ?, version = version + 1, updated_at = ?
           WHERE context_id = ?
             AND version = ?
             AND (current_job_id IS ? OR current_job_id = ?)"#,
    )
    .bind(new_job_id)
    .bind(Utc::now())
    .bind(context_id)
    .bind(expected_version)
    .bind(expected_job_id)
    .bind(expected_job_id)
    .execute(pool)
    .await
    .map_err(|e| Error::unavailable(e.to_string()))?;

    if result.rows_affected() == 0 {
        // Distinguish "context gone" from "lost the race" so callers don't
        // misreport a vanished context as a retryable conflict.
        let still_exists = sqlx::query("SELECT 1 FROM vm_contexts WHERE context_id = ?")
            .bind(context_id)
            .fetch_optional(pool)
            .await
            .map_err(|e| Error::unavailable(e.to_string()))?
            .is_some();
        return if still_exists {
            Err(Error::conflict(format!(
                "context '{context_id}' current_job_id changed concurrently"
            )))
        } else {
            Err(Error::not_found(format!("context '{context_id}' not found")))
        };
    }
    Ok(())
}

pub async fn get_discovered_at_timestamp(_pool: &SqlitePool) -> DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;

    async fn seed(pool: &SqlitePool) -> VmContext {
        let ctx = VmContext::new("vc1.example.com", "dc1", "vm-100", "/dc1/vm/web01", "web01", "cred-1");
        create(pool, &ctx).await.unwrap();
        ctx
    }

    #[tokio::test]
    async fn create_get_roundtrip() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let ctx = seed(db.pool()).await;
        let fetched = get(db.pool(), &ctx.context_id).await.unwrap();
        assert_eq!(fetched.display_name, "web01");
        assert_eq!(fetched.current_job_id, None);
        assert_eq!(fetched.version, 0);
    }

    #[tokio::test]
    async fn duplicate_host_and_name_conflicts() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let ctx = seed(db.pool()).await;
        let dup = VmContext::new("vc1.example.com", "dc1", "vm-999", "/dc1/vm/web01", "web01", "cred-1");
        let err = create(db.pool(), &dup).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        let _ = ctx;
    }

    #[tokio::test]
    async fn cas_succeeds_then_conflicts_on_stale_version() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let ctx = seed(db.pool()).await;

        cas_current_job(db.pool(), &ctx.context_id, None, 0, Some("job-1")).await.unwrap();
        let updated = get(db.pool(), &ctx.context_id).await.unwrap();
        assert_eq!(updated.current_job_id.as_deref(), Some("job-1"));
        assert_eq!(updated.version, 1);

        // Stale expected_version loses the race.
        let err = cas_current_job(db.pool(), &ctx.context_id, Some("job-1"), 0, Some("job-2"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn cas_on_missing_context_is_not_found() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let err = cas_current_job(db.pool(), "ghost", None, 0, Some("job-1")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
