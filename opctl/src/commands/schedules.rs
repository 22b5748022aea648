//! Schedule administration (spec §3 ReplicationSchedule, spec §6 schedules
//! API).

use crate::api::ApiClient;
use crate::output::{self, OutputFormat};
use crate::ScheduleCommands;
use anyhow::Result;
use common::ReplicationSchedule;
use serde::Serialize;
use tabled::Tabled;

#[derive(Tabled, Serialize)]
struct ScheduleRow {
    schedule_id: String,
    name: String,
    cron_expression: String,
    enabled: String,
}

impl From<ReplicationSchedule> for ScheduleRow {
    fn from(s: ReplicationSchedule) -> Self {
        Self {
            schedule_id: s.schedule_id,
            name: s.name,
            cron_expression: s.cron_expression,
            enabled: if s.enabled { "yes" } else { "no" }.to_string(),
        }
    }
}

pub async fn handle(command: ScheduleCommands, api: &ApiClient, output_format: &str) -> Result<()> {
    let format = OutputFormat::from_str(output_format);
    match command {
        ScheduleCommands::Create { name, cron_expression } => {
            let request = serde_json::json!({"name": name, "cron_expression": cron_expression});
            let schedule: ReplicationSchedule = api.post("/api/v1/schedules", &request).await?;
            output::print_success(&format!("Created schedule '{}' ({})", schedule.name, schedule.schedule_id));
        }
        ScheduleCommands::List => {
            let schedules: Vec<ReplicationSchedule> = api.get("/api/v1/schedules").await?;
            let rows: Vec<ScheduleRow> = schedules.into_iter().map(ScheduleRow::from).collect();
            output::print_rows(rows, format)?;
        }
    }
    Ok(())
}
