//! L1 Store: typed repositories over the relational schema, the only way
//! the rest of the core touches persistent state.
//!
//! Every repository here returns `common::Error` narrowed to the three
//! kinds this layer can itself observe: `NotFound`, `Conflict`,
//! `Unavailable`. Higher layers add `Precondition`/`IntegrityViolation`/
//! `Fatal` on top where the violation is semantic rather than storage-level.

pub mod audit;
pub mod contexts;
pub mod enrollment;
pub mod failover;
pub mod jobs;
pub mod scheduling;
pub mod volumes;

use common::Error;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::path::Path;

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, Error> {
        if let Some(path) = database_url.strip_prefix("sqlite://") {
            if path != ":memory:" && !path.is_empty() {
                if let Some(parent) = Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent).map_err(Error::Io)?;
                    }
                }
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(32)
            .connect(database_url)
            .await
            .map_err(|e| Error::unavailable(format!("failed to connect to store: {e}")))?;

        Ok(Self { pool })
    }

    pub async fn in_memory() -> Result<Self, Error> {
        Self::new("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), Error> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::unavailable(format!("migration failed: {e}")))?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<(), Error> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::unavailable(format!("health check failed: {e}")))?;
        Ok(())
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS vm_contexts (
    context_id TEXT PRIMARY KEY,
    vcenter_host TEXT NOT NULL,
    datacenter TEXT NOT NULL,
    moref TEXT NOT NULL,
    path TEXT NOT NULL,
    display_name TEXT NOT NULL,
    cpu_count INTEGER NOT NULL,
    memory_mb INTEGER NOT NULL,
    os_family TEXT NOT NULL,
    power_state TEXT NOT NULL,
    discovered_at TEXT NOT NULL,
    current_status TEXT NOT NULL,
    current_job_id TEXT,
    auto_added INTEGER NOT NULL,
    scheduler_enabled INTEGER NOT NULL,
    credential_id TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(vcenter_host, display_name)
);

CREATE TABLE IF NOT EXISTS replication_jobs (
    job_id TEXT PRIMARY KEY,
    context_id TEXT NOT NULL,
    job_type TEXT NOT NULL,
    status TEXT NOT NULL,
    progress_percent REAL NOT NULL,
    bytes_transferred INTEGER NOT NULL,
    bytes_total INTEGER NOT NULL,
    transfer_rate_mbps REAL NOT NULL,
    previous_change_ids TEXT NOT NULL,
    snapshot_ref TEXT,
    target_config_ref TEXT,
    cancel_requested INTEGER NOT NULL,
    error TEXT,
    started_at TEXT,
    completed_at TEXT,
    execution_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS vm_disks (
    disk_id TEXT PRIMARY KEY,
    job_id TEXT NOT NULL,
    source_disk_id TEXT NOT NULL,
    vmdk_path TEXT NOT NULL,
    size_gb INTEGER NOT NULL,
    capacity_bytes INTEGER NOT NULL,
    datastore TEXT NOT NULL,
    unit_number INTEGER NOT NULL,
    provisioning_type TEXT NOT NULL,
    ossea_volume_id TEXT,
    disk_change_id TEXT,
    progress_percent REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS cbt_history (
    job_id TEXT NOT NULL,
    disk_id TEXT NOT NULL,
    change_id TEXT NOT NULL,
    sync_type TEXT NOT NULL,
    blocks_changed INTEGER NOT NULL,
    bytes_transferred INTEGER NOT NULL,
    duration_seconds REAL NOT NULL,
    success INTEGER NOT NULL,
    recorded_at TEXT NOT NULL,
    PRIMARY KEY (job_id, disk_id, change_id)
);

CREATE TABLE IF NOT EXISTS ossea_volumes (
    volume_id TEXT PRIMARY KEY,
    external_id TEXT NOT NULL,
    size_gb INTEGER NOT NULL,
    volume_type TEXT NOT NULL,
    device_path TEXT,
    mount_point TEXT,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS volume_mounts (
    mount_id TEXT PRIMARY KEY,
    volume_id TEXT NOT NULL,
    mount_path TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS nbd_exports (
    device_path TEXT PRIMARY KEY,
    disk_id TEXT NOT NULL,
    job_id TEXT NOT NULL,
    export_name TEXT NOT NULL,
    port INTEGER NOT NULL,
    locator TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS restore_mounts (
    mount_id TEXT PRIMARY KEY,
    backup_id TEXT NOT NULL,
    mount_path TEXT NOT NULL,
    nbd_device TEXT NOT NULL,
    filesystem_type TEXT NOT NULL,
    mode TEXT NOT NULL,
    status TEXT NOT NULL,
    last_accessed_at TEXT NOT NULL,
    expires_at TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS replication_schedules (
    schedule_id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    cron_expression TEXT NOT NULL,
    schedule_type TEXT NOT NULL,
    enabled INTEGER NOT NULL,
    retry_max_attempts INTEGER NOT NULL,
    retry_backoff_seconds INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS vm_machine_groups (
    group_id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    schedule_id TEXT,
    max_concurrent_vms INTEGER NOT NULL,
    priority INTEGER NOT NULL,
    created_by TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS vm_group_memberships (
    group_id TEXT NOT NULL,
    context_id TEXT NOT NULL,
    priority INTEGER NOT NULL,
    enabled INTEGER NOT NULL,
    added_at TEXT NOT NULL,
    PRIMARY KEY (group_id, context_id)
);

CREATE TABLE IF NOT EXISTS schedule_executions (
    execution_id TEXT PRIMARY KEY,
    schedule_id TEXT NOT NULL,
    group_id TEXT NOT NULL,
    scheduled_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    status TEXT NOT NULL,
    jobs_created INTEGER NOT NULL,
    jobs_completed INTEGER NOT NULL,
    jobs_failed INTEGER NOT NULL,
    jobs_skipped INTEGER NOT NULL,
    duration_seconds REAL
);

CREATE TABLE IF NOT EXISTS failover_jobs (
    failover_id TEXT PRIMARY KEY,
    context_id TEXT NOT NULL,
    mode TEXT NOT NULL,
    status TEXT NOT NULL,
    current_phase TEXT NOT NULL,
    target_vm_id TEXT,
    rollback_of TEXT,
    rollback_options TEXT,
    reason TEXT,
    error TEXT,
    started_at TEXT,
    completed_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS failover_phase_progress (
    failover_id TEXT NOT NULL,
    phase TEXT NOT NULL,
    completed_at TEXT NOT NULL,
    PRIMARY KEY (failover_id, phase)
);

CREATE TABLE IF NOT EXISTS pairing_codes (
    code TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    consumed INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS enrollments (
    enrollment_id TEXT PRIMARY KEY,
    pairing_code TEXT NOT NULL,
    node_name TEXT NOT NULL,
    node_version TEXT NOT NULL,
    node_public_key TEXT NOT NULL,
    key_fingerprint TEXT NOT NULL,
    challenge TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS active_connections (
    enrollment_id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    last_seen TEXT NOT NULL,
    last_error TEXT
);

CREATE TABLE IF NOT EXISTS audit_events (
    event_id TEXT PRIMARY KEY,
    timestamp TEXT NOT NULL,
    event_type TEXT NOT NULL,
    severity TEXT NOT NULL,
    subject_id TEXT,
    operator TEXT,
    action TEXT NOT NULL,
    details TEXT
);

CREATE INDEX IF NOT EXISTS idx_jobs_status ON replication_jobs(status);
CREATE INDEX IF NOT EXISTS idx_jobs_context ON replication_jobs(context_id);
CREATE INDEX IF NOT EXISTS idx_contexts_vcenter ON vm_contexts(vcenter_host, datacenter);
CREATE INDEX IF NOT EXISTS idx_audit_created ON audit_events(timestamp);
CREATE INDEX IF NOT EXISTS idx_failover_context ON failover_jobs(context_id);
CREATE INDEX IF NOT EXISTS idx_failover_status ON failover_jobs(status);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrate_and_health_check() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        db.health_check().await.unwrap();
    }
}
