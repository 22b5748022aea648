//! Repositories for `OsseaVolume`, `VolumeMount`, NBD export allocation
//! (L5), and `RestoreMount` (T2).

use chrono::{DateTime, Utc};
use common::{MountStatus, OsseaVolume, RestoreMount, RestoreMountMode, RestoreMountStatus, VolumeMount, VolumeStatus, VolumeType};
use sqlx::{Row, SqlitePool};

fn db_err(e: sqlx::Error) -> common::Error {
    common::Error::unavailable(e.to_string())
}

// ---------------------------------------------------------------------
// OsseaVolume
// ---------------------------------------------------------------------

fn volume_type_str(t: VolumeType) -> &'static str {
    match t {
        VolumeType::Root => "root",
        VolumeType::Data => "data",
    }
}

fn str_volume_type(s: &str) -> Result<VolumeType, common::Error> {
    Ok(match s {
        "root" => VolumeType::Root,
        "data" => VolumeType::Data,
        other => return Err(common::Error::integrity(format!("unknown volume type '{other}'"))),
    })
}

fn volume_status_str(s: VolumeStatus) -> &'static str {
    match s {
        VolumeStatus::Unattached => "unattached",
        VolumeStatus::AttachedToAppliance => "attached_to_appliance",
        VolumeStatus::AttachedToTargetVm => "attached_to_target_vm",
    }
}

fn str_volume_status(s: &str) -> Result<VolumeStatus, common::Error> {
    Ok(match s {
        "unattached" => VolumeStatus::Unattached,
        "attached_to_appliance" => VolumeStatus::AttachedToAppliance,
        "attached_to_target_vm" => VolumeStatus::AttachedToTargetVm,
        other => return Err(common::Error::integrity(format!("unknown volume status '{other}'"))),
    })
}

fn row_to_volume(row: sqlx::sqlite::SqliteRow) -> Result<OsseaVolume, common::Error> {
    let vtype: String = row.try_get("volume_type").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;
    Ok(OsseaVolume {
        volume_id: row.try_get("volume_id").map_err(db_err)?,
        external_id: row.try_get("external_id").map_err(db_err)?,
        size_gb: row.try_get::<i64, _>("size_gb").map_err(db_err)? as u64,
        volume_type: str_volume_type(&vtype)?,
        device_path: row.try_get("device_path").map_err(db_err)?,
        mount_point: row.try_get("mount_point").map_err(db_err)?,
        status: str_volume_status(&status)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

pub async fn create_volume(pool: &SqlitePool, v: &OsseaVolume) -> Result<(), common::Error> {
    sqlx::query(
        r#"INSERT INTO ossea_volumes
           (volume_id, external_id, size_gb, volume_type, device_path, mount_point, status, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&v.volume_id)
    .bind(&v.external_id)
    .bind(v.size_gb as i64)
    .bind(volume_type_str(v.volume_type))
    .bind(&v.device_path)
    .bind(&v.mount_point)
    .bind(volume_status_str(v.status))
    .bind(v.created_at)
    .execute(pool)
    .await
    .map_err(db_err)?;
    Ok(())
}

pub async fn get_volume(pool: &SqlitePool, volume_id: &str) -> Result<OsseaVolume, common::Error> {
    let row = sqlx::query("SELECT * FROM ossea_volumes WHERE volume_id = ?")
        .bind(volume_id)
        .fetch_optional(pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| common::Error::not_found(format!("volume '{volume_id}' not found")))?;
    row_to_volume(row)
}

/// Transition a volume's status. Refuses to jump between the two attached
/// states directly — a volume is never both appliance- and VM-attached
/// (spec invariant); callers must detach first.
pub async fn set_volume_status(pool: &SqlitePool, volume_id: &str, status: VolumeStatus) -> Result<(), common::Error> {
    let current = get_volume(pool, volume_id).await?;
    if matches!(current.status, VolumeStatus::AttachedToAppliance)
        && matches!(status, VolumeStatus::AttachedToTargetVm)
    {
        return Err(common::Error::precondition(format!(
            "volume '{volume_id}' must be detached before attaching to a target VM"
        )));
    }
    sqlx::query("UPDATE ossea_volumes SET status = ? WHERE volume_id = ?")
        .bind(volume_status_str(status))
        .bind(volume_id)
        .execute(pool)
        .await
        .map_err(db_err)?;
    Ok(())
}

pub async fn set_device_path(pool: &SqlitePool, volume_id: &str, device_path: Option<&str>) -> Result<(), common::Error> {
    sqlx::query("UPDATE ossea_volumes SET device_path = ? WHERE volume_id = ?")
        .bind(device_path)
        .bind(volume_id)
        .execute(pool)
        .await
        .map_err(db_err)?;
    Ok(())
}

// ---------------------------------------------------------------------
// VolumeMount
// ---------------------------------------------------------------------

fn mount_status_str(s: MountStatus) -> &'static str {
    match s {
        MountStatus::Unmounted => "unmounted",
        MountStatus::Mounting => "mounting",
        MountStatus::Mounted => "mounted",
        MountStatus::UnmountPending => "unmount_pending",
        MountStatus::Error => "error",
    }
}

fn str_mount_status(s: &str) -> Result<MountStatus, common::Error> {
    Ok(match s {
        "unmounted" => MountStatus::Unmounted,
        "mounting" => MountStatus::Mounting,
        "mounted" => MountStatus::Mounted,
        "unmount_pending" => MountStatus::UnmountPending,
        "error" => MountStatus::Error,
        other => return Err(common::Error::integrity(format!("unknown mount status '{other}'"))),
    })
}

pub async fn create_volume_mount(pool: &SqlitePool, m: &VolumeMount) -> Result<(), common::Error> {
    sqlx::query(
        "INSERT INTO volume_mounts (mount_id, volume_id, mount_path, status, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&m.mount_id)
    .bind(&m.volume_id)
    .bind(&m.mount_path)
    .bind(mount_status_str(m.status))
    .bind(m.created_at)
    .bind(m.updated_at)
    .execute(pool)
    .await
    .map_err(db_err)?;
    Ok(())
}

pub async fn update_volume_mount_status(pool: &SqlitePool, mount_id: &str, status: MountStatus) -> Result<(), common::Error> {
    let result = sqlx::query("UPDATE volume_mounts SET status = ?, updated_at = ? WHERE mount_id = ?")
        .bind(mount_status_str(status))
        .bind(Utc::now())
        .bind(mount_id)
        .execute(pool)
        .await
        .map_err(db_err)?;
    if result.rows_affected() == 0 {
        return Err(common::Error::not_found(format!("volume mount '{mount_id}' not found")));
    }
    Ok(())
}

pub async fn delete_volume_mounts_for_volume(pool: &SqlitePool, volume_id: &str) -> Result<(), common::Error> {
    sqlx::query("DELETE FROM volume_mounts WHERE volume_id = ?")
        .bind(volume_id)
        .execute(pool)
        .await
        .map_err(db_err)?;
    Ok(())
}

#[allow(dead_code)]
fn row_to_volume_mount(row: sqlx::sqlite::SqliteRow) -> Result<VolumeMount, common::Error> {
    let status: String = row.try_get("status").map_err(db_err)?;
    Ok(VolumeMount {
        mount_id: row.try_get("mount_id").map_err(db_err)?,
        volume_id: row.try_get("volume_id").map_err(db_err)?,
        mount_path: row.try_get("mount_path").map_err(db_err)?,
        status: str_mount_status(&status)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

// ---------------------------------------------------------------------
// NBD export allocation (L5)
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NbdExport {
    pub device_path: String,
    pub disk_id: String,
    pub job_id: String,
    pub export_name: String,
    pub port: u16,
    pub locator: String,
    pub created_at: DateTime<Utc>,
}

/// The set of device paths currently holding an export, read and inserted
/// in one transaction so allocation is atomic against the store (spec
/// §4.L5). Callers pick the next free port/device outside the lock and
/// retry on `Conflict` if another allocator won the race.
pub async fn get_allocated_nbd_devices(pool: &SqlitePool) -> Result<Vec<String>, common::Error> {
    let rows = sqlx::query("SELECT device_path FROM nbd_exports")
        .fetch_all(pool)
        .await
        .map_err(db_err)?;
    rows.into_iter()
        .map(|r| r.try_get("device_path").map_err(db_err))
        .collect()
}

pub async fn allocate_nbd_export(pool: &SqlitePool, export: &NbdExport) -> Result<(), common::Error> {
    let mut tx = pool.begin().await.map_err(db_err)?;
    let taken: Option<i64> = sqlx::query_scalar("SELECT 1 FROM nbd_exports WHERE device_path = ?")
        .bind(&export.device_path)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
    if taken.is_some() {
        return Err(common::Error::conflict(format!(
            "NBD device '{}' already allocated",
            export.device_path
        )));
    }
    sqlx::query(
        r#"INSERT INTO nbd_exports (device_path, disk_id, job_id, export_name, port, locator, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&export.device_path)
    .bind(&export.disk_id)
    .bind(&export.job_id)
    .bind(&export.export_name)
    .bind(export.port as i64)
    .bind(&export.locator)
    .bind(export.created_at)
    .execute(&mut *tx)
    .await
    .map_err(db_err)?;
    tx.commit().await.map_err(db_err)?;
    Ok(())
}

/// Idempotent: deallocating an export that is already gone is a no-op.
pub async fn deallocate_nbd_export(pool: &SqlitePool, device_path: &str) -> Result<(), common::Error> {
    sqlx::query("DELETE FROM nbd_exports WHERE device_path = ?")
        .bind(device_path)
        .execute(pool)
        .await
        .map_err(db_err)?;
    Ok(())
}

pub async fn deallocate_nbd_exports_for_job(pool: &SqlitePool, job_id: &str) -> Result<(), common::Error> {
    sqlx::query("DELETE FROM nbd_exports WHERE job_id = ?")
        .bind(job_id)
        .execute(pool)
        .await
        .map_err(db_err)?;
    Ok(())
}

// ---------------------------------------------------------------------
// RestoreMount (T2)
// ---------------------------------------------------------------------

fn restore_status_str(s: RestoreMountStatus) -> &'static str {
    match s {
        RestoreMountStatus::Mounting => "mounting",
        RestoreMountStatus::Mounted => "mounted",
        RestoreMountStatus::Unmounting => "unmounting",
        RestoreMountStatus::Failed => "failed",
    }
}

fn str_restore_status(s: &str) -> Result<RestoreMountStatus, common::Error> {
    Ok(match s {
        "mounting" => RestoreMountStatus::Mounting,
        "mounted" => RestoreMountStatus::Mounted,
        "unmounting" => RestoreMountStatus::Unmounting,
        "failed" => RestoreMountStatus::Failed,
        other => return Err(common::Error::integrity(format!("unknown restore mount status '{other}'"))),
    })
}

fn restore_mode_str(m: RestoreMountMode) -> &'static str {
    match m {
        RestoreMountMode::Ro => "ro",
        RestoreMountMode::Rw => "rw",
    }
}

fn str_restore_mode(s: &str) -> Result<RestoreMountMode, common::Error> {
    Ok(match s {
        "ro" => RestoreMountMode::Ro,
        "rw" => RestoreMountMode::Rw,
        other => return Err(common::Error::integrity(format!("unknown restore mount mode '{other}'"))),
    })
}

fn row_to_restore_mount(row: sqlx::sqlite::SqliteRow) -> Result<RestoreMount, common::Error> {
    let status: String = row.try_get("status").map_err(db_err)?;
    let mode: String = row.try_get("mode").map_err(db_err)?;
    Ok(RestoreMount {
        mount_id: row.try_get("mount_id").map_err(db_err)?,
        backup_id: row.try_get("backup_id").map_err(db_err)?,
        mount_path: row.try_get("mount_path").map_err(db_err)?,
        nbd_device: row.try_get("nbd_device").map_err(db_err)?,
        filesystem_type: row.try_get("filesystem_type").map_err(db_err)?,
        mode: str_restore_mode(&mode)?,
        status: str_restore_status(&status)?,
        last_accessed_at: row.try_get("last_accessed_at").map_err(db_err)?,
        expires_at: row.try_get("expires_at").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

/// The store is the arbitrator of "at most one active mount per NBD
/// device" (spec invariant): this insert fails with `Conflict` if another
/// `mounted`/`mounting` row already claims the device.
pub async fn create_restore_mount(pool: &SqlitePool, m: &RestoreMount) -> Result<(), common::Error> {
    let mut tx = pool.begin().await.map_err(db_err)?;
    let clashing: Option<i64> = sqlx::query_scalar(
        "SELECT 1 FROM restore_mounts WHERE nbd_device = ? AND status IN ('mounting', 'mounted')",
    )
    .bind(&m.nbd_device)
    .fetch_optional(&mut *tx)
    .await
    .map_err(db_err)?;
    if clashing.is_some() {
        return Err(common::Error::conflict(format!(
            "NBD device '{}' already has an active restore mount",
            m.nbd_device
        )));
    }
    sqlx::query(
        r#"INSERT INTO restore_mounts
           (mount_id, backup_id, mount_path, nbd_device, filesystem_type, mode, status,
            last_accessed_at, expires_at, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&m.mount_id)
    .bind(&m.backup_id)
    .bind(&m.mount_path)
    .bind(&m.nbd_device)
    .bind(&m.filesystem_type)
    .bind(restore_mode_str(m.mode))
    .bind(restore_status_str(m.status))
    .bind(m.last_accessed_at)
    .bind(m.expires_at)
    .bind(m.created_at)
    .execute(&mut *tx)
    .await
    .map_err(db_err)?;
    tx.commit().await.map_err(db_err)?;
    Ok(())
}

pub async fn get_restore_mount(pool: &SqlitePool, mount_id: &str) -> Result<RestoreMount, common::Error> {
    let row = sqlx::query("SELECT * FROM restore_mounts WHERE mount_id = ?")
        .bind(mount_id)
        .fetch_optional(pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| common::Error::not_found(format!("restore mount '{mount_id}' not found")))?;
    row_to_restore_mount(row)
}

pub async fn list_active_restore_mounts(pool: &SqlitePool) -> Result<Vec<RestoreMount>, common::Error> {
    let rows = sqlx::query("SELECT * FROM restore_mounts WHERE status = 'mounted' ORDER BY last_accessed_at ASC")
        .fetch_all(pool)
        .await
        .map_err(db_err)?;
    rows.into_iter().map(row_to_restore_mount).collect()
}

pub async fn list_expired_restore_mounts(pool: &SqlitePool, now: DateTime<Utc>) -> Result<Vec<RestoreMount>, common::Error> {
    let rows = sqlx::query(
        "SELECT * FROM restore_mounts WHERE status = 'mounted' AND expires_at IS NOT NULL AND expires_at < ?",
    )
    .bind(now)
    .fetch_all(pool)
    .await
    .map_err(db_err)?;
    rows.into_iter().map(row_to_restore_mount).collect()
}

pub async fn touch_restore_mount(pool: &SqlitePool, mount_id: &str, now: DateTime<Utc>) -> Result<(), common::Error> {
    let result = sqlx::query("UPDATE restore_mounts SET last_accessed_at = ? WHERE mount_id = ? AND status = 'mounted'")
        .bind(now)
        .bind(mount_id)
        .execute(pool)
        .await
        .map_err(db_err)?;
    if result.rows_affected() == 0 {
        return Err(common::Error::not_found(format!("mounted restore '{mount_id}' not found")));
    }
    Ok(())
}

/// Only `mounted ⇒ unmounting ⇒ deleted` is a valid sweep transition (spec
/// §4.T2); anything else is a no-op so sweeps stay idempotent.
pub async fn begin_unmount_restore_mount(pool: &SqlitePool, mount_id: &str) -> Result<bool, common::Error> {
    let result = sqlx::query("UPDATE restore_mounts SET status = 'unmounting' WHERE mount_id = ? AND status = 'mounted'")
        .bind(mount_id)
        .execute(pool)
        .await
        .map_err(db_err)?;
    Ok(result.rows_affected() > 0)
}

pub async fn delete_restore_mount(pool: &SqlitePool, mount_id: &str) -> Result<(), common::Error> {
    sqlx::query("DELETE FROM restore_mounts WHERE mount_id = ?")
        .bind(mount_id)
        .execute(pool)
        .await
        .map_err(db_err)?;
    Ok(())
}

pub async fn mark_restore_mount_failed(pool: &SqlitePool, mount_id: &str) -> Result<(), common::Error> {
    sqlx::query("UPDATE restore_mounts SET status = 'failed' WHERE mount_id = ?")
        .bind(mount_id)
        .execute(pool)
        .await
        .map_err(db_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;

    #[tokio::test]
    async fn nbd_allocation_is_exclusive_per_device() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let export = NbdExport {
            device_path: "/dev/nbd0".into(),
            disk_id: "disk-1".into(),
            job_id: "job-1".into(),
            export_name: "export-1".into(),
            port: 10809,
            locator: "nbd://hub:10809/export-1".into(),
            created_at: Utc::now(),
        };
        allocate_nbd_export(db.pool(), &export).await.unwrap();
        let err = allocate_nbd_export(db.pool(), &export).await.unwrap_err();
        assert!(matches!(err, common::Error::Conflict(_)));
        deallocate_nbd_export(db.pool(), "/dev/nbd0").await.unwrap();
        deallocate_nbd_export(db.pool(), "/dev/nbd0").await.unwrap();
    }

    #[tokio::test]
    async fn restore_mount_exclusive_per_nbd_device() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let m = RestoreMount {
            mount_id: "m1".into(),
            backup_id: "b1".into(),
            mount_path: "/mnt/b1".into(),
            nbd_device: "/dev/nbd1".into(),
            filesystem_type: "ext4".into(),
            mode: RestoreMountMode::Ro,
            status: RestoreMountStatus::Mounted,
            last_accessed_at: Utc::now(),
            expires_at: None,
            created_at: Utc::now(),
        };
        create_restore_mount(db.pool(), &m).await.unwrap();
        let mut other = m.clone();
        other.mount_id = "m2".into();
        let err = create_restore_mount(db.pool(), &other).await.unwrap_err();
        assert!(matches!(err, common::Error::Conflict(_)));
    }

    #[tokio::test]
    async fn expired_sweep_only_matches_past_expiry() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let mut m = RestoreMount {
            mount_id: "m1".into(),
            backup_id: "b1".into(),
            mount_path: "/mnt/b1".into(),
            nbd_device: "/dev/nbd1".into(),
            filesystem_type: "ext4".into(),
            mode: RestoreMountMode::Ro,
            status: RestoreMountStatus::Mounted,
            last_accessed_at: Utc::now(),
            expires_at: Some(Utc::now() - chrono::Duration::seconds(5)),
            created_at: Utc::now(),
        };
        create_restore_mount(db.pool(), &m).await.unwrap();
        let expired = list_expired_restore_mounts(db.pool(), Utc::now()).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert!(begin_unmount_restore_mount(db.pool(), "m1").await.unwrap());
        m.status = RestoreMountStatus::Unmounting;
        let expired_again = list_expired_restore_mounts(db.pool(), Utc::now()).await.unwrap();
        assert!(expired_again.is_empty());
    }
}
