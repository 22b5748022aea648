//! T2 restore mount manager: a thin layer over `store::volumes`'s
//! `RestoreMount` repository plus the idle-sweep background task that
//! reclaims mounts past their TTL (spec §4.T2).
//!
//! Shares the NBD device pool with L5's replication targets — a restore
//! browse session and an in-flight replication transfer never contend for
//! the same `/dev/nbdN`, since both go through the same allocation check.

use crate::store::volumes;
use chrono::Utc;
use common::{Error, RestoreMount, RestoreMountMode, RestoreMountStatus};
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::{info, warn};

const DEVICE_POOL_SIZE: u32 = 256;
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct MountManager {
    pool: SqlitePool,
}

impl MountManager {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Mounts `backup_id` read-only or read-write at `mount_path` over the
    /// next free NBD device, optionally expiring after `ttl_seconds`.
    pub async fn mount(
        &self,
        backup_id: &str,
        mount_path: &str,
        filesystem_type: &str,
        mode: RestoreMountMode,
        ttl_seconds: Option<i64>,
    ) -> Result<RestoreMount, Error> {
        let device_path = self.allocate_device().await?;
        let now = Utc::now();
        let mount = RestoreMount {
            mount_id: uuid::Uuid::new_v4().to_string(),
            backup_id: backup_id.to_string(),
            mount_path: mount_path.to_string(),
            nbd_device: device_path,
            filesystem_type: filesystem_type.to_string(),
            mode,
            status: RestoreMountStatus::Mounted,
            last_accessed_at: now,
            expires_at: ttl_seconds.map(|secs| now + chrono::Duration::seconds(secs)),
            created_at: now,
        };
        volumes::create_restore_mount(&self.pool, &mount).await?;
        Ok(mount)
    }

    /// Picks a device not already claimed by either a replication NBD
    /// export or another active restore mount.
    async fn allocate_device(&self) -> Result<String, Error> {
        let mut taken: std::collections::HashSet<String> = volumes::get_allocated_nbd_devices(&self.pool).await?.into_iter().collect();
        for active in volumes::list_active_restore_mounts(&self.pool).await? {
            taken.insert(active.nbd_device);
        }
        for slot in 0..DEVICE_POOL_SIZE {
            let candidate = format!("/dev/nbd{slot}");
            if !taken.contains(&candidate) {
                return Ok(candidate);
            }
        }
        Err(Error::unavailable("NBD device pool exhausted"))
    }

    pub async fn touch(&self, mount_id: &str) -> Result<(), Error> {
        volumes::touch_restore_mount(&self.pool, mount_id, Utc::now()).await
    }

    pub async fn get(&self, mount_id: &str) -> Result<RestoreMount, Error> {
        volumes::get_restore_mount(&self.pool, mount_id).await
    }

    pub async fn list_active(&self) -> Result<Vec<RestoreMount>, Error> {
        volumes::list_active_restore_mounts(&self.pool).await
    }

    /// Two-step unmount: flip to `unmounting` first, then drop the row. A
    /// crash between the two leaves a mount that future callers see as
    /// inactive (it no longer appears in `list_active`) rather than one
    /// still claiming a device that's actually free.
    pub async fn unmount(&self, mount_id: &str) -> Result<(), Error> {
        if volumes::begin_unmount_restore_mount(&self.pool, mount_id).await? {
            volumes::delete_restore_mount(&self.pool, mount_id).await?;
        }
        Ok(())
    }

    pub async fn mark_failed(&self, mount_id: &str) -> Result<(), Error> {
        volumes::mark_restore_mount_failed(&self.pool, mount_id).await
    }

    /// One pass of the idle sweep: unmounts everything past its `expires_at`.
    pub async fn sweep_once(&self) -> Result<usize, Error> {
        let expired = volumes::list_expired_restore_mounts(&self.pool, Utc::now()).await?;
        for mount in &expired {
            if let Err(e) = self.unmount(&mount.mount_id).await {
                warn!(mount_id = %mount.mount_id, error = %e, "failed to unmount expired restore");
            }
        }
        Ok(expired.len())
    }

    /// Runs the idle sweep on a fixed interval until the process exits.
    /// Intended to be `tokio::spawn`ed once from `main`, mirroring the
    /// enrolment manager's own expiry sweep.
    pub async fn run_sweep(self, interval: Duration) {
        let mut ticker = tokio::time::interval(if interval.is_zero() { DEFAULT_SWEEP_INTERVAL } else { interval });
        loop {
            ticker.tick().await;
            match self.sweep_once().await {
                Ok(0) => {}
                Ok(n) => info!(count = n, "swept expired restore mounts"),
                Err(e) => warn!(error = %e, "restore mount sweep failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;

    #[tokio::test]
    async fn mount_allocates_distinct_devices() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let mgr = MountManager::new(db.pool().clone());
        let a = mgr.mount("backup-1", "/mnt/r1", "ext4", RestoreMountMode::Ro, None).await.unwrap();
        let b = mgr.mount("backup-2", "/mnt/r2", "ext4", RestoreMountMode::Ro, None).await.unwrap();
        assert_ne!(a.nbd_device, b.nbd_device);
    }

    #[tokio::test]
    async fn sweep_unmounts_only_expired() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let mgr = MountManager::new(db.pool().clone());
        let expiring = mgr.mount("backup-1", "/mnt/r1", "ext4", RestoreMountMode::Ro, Some(-5)).await.unwrap();
        let fresh = mgr.mount("backup-2", "/mnt/r2", "ext4", RestoreMountMode::Ro, Some(3600)).await.unwrap();

        let swept = mgr.sweep_once().await.unwrap();
        assert_eq!(swept, 1);

        let active = mgr.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].mount_id, fresh.mount_id);
        assert!(mgr.get(&expiring.mount_id).await.is_err());
    }

    #[tokio::test]
    async fn touch_refreshes_last_accessed() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let mgr = MountManager::new(db.pool().clone());
        let mount = mgr.mount("backup-1", "/mnt/r1", "ext4", RestoreMountMode::Rw, None).await.unwrap();
        mgr.touch(&mount.mount_id).await.unwrap();
        let fetched = mgr.get(&mount.mount_id).await.unwrap();
        assert!(fetched.last_accessed_at >= mount.last_accessed_at);
    }
}
