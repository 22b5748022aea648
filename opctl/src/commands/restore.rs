//! File-level restore mount control (spec §4.T2, §6 `/api/v1/restores/*`).

use crate::api::ApiClient;
use crate::output::{self, OutputFormat};
use crate::RestoreCommands;
use anyhow::Result;
use common::{RestoreMount, RestoreMountMode};
use serde::Serialize;
use tabled::Tabled;

#[derive(Tabled, Serialize)]
struct MountRow {
    mount_id: String,
    backup_id: String,
    mount_path: String,
    nbd_device: String,
    status: String,
}

impl From<RestoreMount> for MountRow {
    fn from(m: RestoreMount) -> Self {
        Self {
            mount_id: m.mount_id,
            backup_id: m.backup_id,
            mount_path: m.mount_path,
            nbd_device: m.nbd_device,
            status: format!("{:?}", m.status),
        }
    }
}

pub async fn handle(command: RestoreCommands, api: &ApiClient, output_format: &str) -> Result<()> {
    let format = OutputFormat::from_str(output_format);
    match command {
        RestoreCommands::Mount { backup_id, mount_path, filesystem_type, rw, ttl_seconds } => {
            let request = serde_json::json!({
                "backup_id": backup_id,
                "mount_path": mount_path,
                "filesystem_type": filesystem_type,
                "mode": if rw { RestoreMountMode::Rw } else { RestoreMountMode::Ro },
                "ttl_seconds": ttl_seconds,
            });
            let mount: RestoreMount = api.post("/api/v1/restores", &request).await?;
            output::print_success(&format!("Mounted {} at {} ({})", mount.backup_id, mount.mount_path, mount.mount_id));
        }
        RestoreCommands::List => {
            let mounts: Vec<RestoreMount> = api.get("/api/v1/restores").await?;
            let rows: Vec<MountRow> = mounts.into_iter().map(MountRow::from).collect();
            output::print_rows(rows, format)?;
        }
        RestoreCommands::Show { mount_id } => {
            let mount: RestoreMount = api.get(&format!("/api/v1/restores/{mount_id}")).await?;
            output::print_single(&mount, format)?;
        }
        RestoreCommands::Unmount { mount_id } => {
            let _: serde_json::Value = api.post(&format!("/api/v1/restores/{mount_id}/unmount"), &serde_json::json!({})).await?;
            output::print_success(&format!("Unmounted {mount_id}"));
        }
    }
    Ok(())
}
