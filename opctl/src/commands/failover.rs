//! Failover/rollback invocation (spec §4.M3, §6 `/api/v1/failover/*`).

use crate::api::ApiClient;
use crate::output::{self, OutputFormat};
use crate::FailoverCommands;
use anyhow::Result;
use common::{FailoverJob, FailoverMode, RollbackOptions};
use dialoguer::Confirm;

pub async fn handle(command: FailoverCommands, api: &ApiClient, output_format: &str) -> Result<()> {
    let format = OutputFormat::from_str(output_format);
    match command {
        FailoverCommands::Start { context_id, mode, reason } => {
            let mode = if mode == "live" { FailoverMode::Live } else { FailoverMode::Test };
            if mode == FailoverMode::Live {
                let confirmed = Confirm::new()
                    .with_prompt(format!("Start a LIVE failover of {context_id}? This powers off the source VM."))
                    .interact()?;
                if !confirmed {
                    output::print_info("failover cancelled");
                    return Ok(());
                }
            }
            #[derive(serde::Serialize)]
            struct Request {
                context_id: String,
                mode: FailoverMode,
                reason: Option<String>,
            }
            #[derive(serde::Deserialize)]
            struct Response {
                failover_id: String,
            }
            let response: Response = api.post("/api/v1/failover/unified", &Request { context_id, mode, reason }).await?;
            output::print_success(&format!("Failover started: {}", response.failover_id));
        }
        FailoverCommands::Rollback { failover_id, power_on_source, force_cleanup, reason } => {
            #[derive(serde::Serialize)]
            struct Request {
                failover_id: String,
                options: RollbackOptions,
                reason: Option<String>,
            }
            #[derive(serde::Deserialize)]
            struct Response {
                failover_id: String,
            }
            let options =
                RollbackOptions { power_on_source_vm: power_on_source, force_cleanup, failover_type: FailoverMode::Test };
            let response: Response = api.post("/api/v1/failover/rollback", &Request { failover_id, options, reason }).await?;
            output::print_success(&format!("Rollback started: {}", response.failover_id));
        }
        FailoverCommands::Status { failover_id } => {
            let job: FailoverJob = api.get(&format!("/api/v1/failover/{failover_id}")).await?;
            output::print_single(&job, format)?;
        }
        FailoverCommands::Progress { failover_id } => {
            let progress: serde_json::Value = api.get(&format!("/api/v1/failover/progress/{failover_id}")).await?;
            output::print_single(&progress, format)?;
        }
    }
    Ok(())
}
