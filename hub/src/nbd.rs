//! L5 NBD target manager: allocates an export name + port for each
//! attached target volume, bound to the job that owns the transfer.

use crate::store::volumes::{self, NbdExport};
use chrono::Utc;
use common::Error;
use sqlx::SqlitePool;

const DEVICE_POOL_SIZE: u32 = 256;
const BASE_PORT: u16 = 10809;

pub struct NbdTargetManager {
    hub_host: String,
}

impl NbdTargetManager {
    pub fn new(hub_host: impl Into<String>) -> Self {
        Self { hub_host: hub_host.into() }
    }

    /// Allocates the next free device/port pair for `(job_id, disk_id)` and
    /// persists it atomically against the store (spec §4.L5: "allocation
    /// is atomic against the store"). Returns the `nbd://host:port/export`
    /// locator the mover will write to.
    pub async fn allocate(&self, pool: &SqlitePool, job_id: &str, disk_id: &str) -> Result<String, Error> {
        let allocated = volumes::get_allocated_nbd_devices(pool).await?;
        let taken: std::collections::HashSet<String> = allocated.into_iter().collect();

        for slot in 0..DEVICE_POOL_SIZE {
            let device_path = format!("/dev/nbd{slot}");
            if taken.contains(&device_path) {
                continue;
            }
            let port = BASE_PORT + slot as u16;
            let export_name = format!("job-{job_id}-disk-{disk_id}");
            let locator = format!("nbd://{}:{}/{}", self.hub_host, port, export_name);
            let export = NbdExport {
                device_path: device_path.clone(),
                disk_id: disk_id.to_string(),
                job_id: job_id.to_string(),
                export_name,
                port,
                locator: locator.clone(),
                created_at: Utc::now(),
            };
            match volumes::allocate_nbd_export(pool, &export).await {
                Ok(()) => return Ok(locator),
                Err(Error::Conflict(_)) => continue, // another allocator won the race on this slot
                Err(e) => return Err(e),
            }
        }
        Err(Error::unavailable("NBD device pool exhausted"))
    }

    pub async fn release(&self, pool: &SqlitePool, device_path: &str) -> Result<(), Error> {
        volumes::deallocate_nbd_export(pool, device_path).await
    }

    /// Exports outlive the mover process but are torn down when the owning
    /// job reaches a terminal state (spec §4.L5).
    pub async fn release_for_job(&self, pool: &SqlitePool, job_id: &str) -> Result<(), Error> {
        volumes::deallocate_nbd_exports_for_job(pool, job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;

    #[tokio::test]
    async fn allocate_gives_distinct_devices_per_disk() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let mgr = NbdTargetManager::new("hub.local");
        let locator_a = mgr.allocate(db.pool(), "job-1", "disk-a").await.unwrap();
        let locator_b = mgr.allocate(db.pool(), "job-1", "disk-b").await.unwrap();
        assert_ne!(locator_a, locator_b);
    }

    #[tokio::test]
    async fn release_for_job_frees_all_its_exports() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let mgr = NbdTargetManager::new("hub.local");
        mgr.allocate(db.pool(), "job-1", "disk-a").await.unwrap();
        mgr.allocate(db.pool(), "job-1", "disk-b").await.unwrap();
        mgr.release_for_job(db.pool(), "job-1").await.unwrap();
        let remaining = volumes::get_allocated_nbd_devices(db.pool()).await.unwrap();
        assert!(remaining.is_empty());
    }
}
