//! Protection-group administration: create groups, list them, add members
//! (spec §3 VMMachineGroup / VMGroupMembership, spec §6 machine-groups API).

use crate::api::ApiClient;
use crate::output::{self, OutputFormat};
use crate::GroupCommands;
use anyhow::Result;
use common::VmMachineGroup;
use serde::Serialize;
use tabled::Tabled;

#[derive(Tabled, Serialize)]
struct GroupRow {
    group_id: String,
    name: String,
    max_concurrent_vms: u32,
    priority: i32,
    schedule_id: String,
}

impl From<VmMachineGroup> for GroupRow {
    fn from(g: VmMachineGroup) -> Self {
        Self {
            group_id: g.group_id,
            name: g.name,
            max_concurrent_vms: g.max_concurrent_vms,
            priority: g.priority,
            schedule_id: g.schedule_id.unwrap_or_else(|| "-".to_string()),
        }
    }
}

pub async fn handle(command: GroupCommands, api: &ApiClient, output_format: &str) -> Result<()> {
    let format = OutputFormat::from_str(output_format);
    match command {
        GroupCommands::Create { name, max_concurrent_vms, created_by, schedule_id } => {
            let request = serde_json::json!({
                "name": name,
                "max_concurrent_vms": max_concurrent_vms,
                "created_by": created_by,
                "schedule_id": schedule_id,
            });
            let group: VmMachineGroup = api.post("/api/v1/machine-groups", &request).await?;
            output::print_success(&format!("Created group '{}' ({})", group.name, group.group_id));
        }
        GroupCommands::List => {
            let groups: Vec<VmMachineGroup> = api.get("/api/v1/machine-groups").await?;
            let rows: Vec<GroupRow> = groups.into_iter().map(GroupRow::from).collect();
            output::print_rows(rows, format)?;
        }
        GroupCommands::AddMember { group_id, context_id, priority } => {
            let request = serde_json::json!({"context_id": context_id, "priority": priority});
            let _: serde_json::Value = api.post(&format!("/api/v1/machine-groups/{group_id}/members"), &request).await?;
            output::print_success(&format!("Added {context_id} to group {group_id}"));
        }
    }
    Ok(())
}
