//! Replication job control: start, inspect, watch progress, cancel (spec
//! §4.M2, §6 `/api/v1/replication/*`).

use crate::api::ApiClient;
use crate::output::{self, OutputFormat};
use crate::ReplicationCommands;
use anyhow::Result;
use common::{ProgressUpdate, ReplicationJob};

pub async fn handle(command: ReplicationCommands, api: &ApiClient, output_format: &str) -> Result<()> {
    let format = OutputFormat::from_str(output_format);
    match command {
        ReplicationCommands::Start { context_id } => {
            #[derive(serde::Serialize)]
            struct Request {
                context_id: String,
            }
            #[derive(serde::Deserialize)]
            struct Response {
                job_id: String,
            }
            let response: Response = api.post("/api/v1/replication/jobs", &Request { context_id }).await?;
            output::print_success(&format!("Replication job started: {}", response.job_id));
        }
        ReplicationCommands::Show { job_id } => {
            let job: ReplicationJob = api.get(&format!("/api/v1/replication/jobs/{job_id}")).await?;
            output::print_single(&job, format)?;
        }
        ReplicationCommands::Progress { job_id } => {
            let progress: Option<ProgressUpdate> = api.get(&format!("/api/v1/replication/jobs/{job_id}/progress")).await?;
            match progress {
                Some(p) => output::print_single(&p, format)?,
                None => output::print_info("no progress recorded yet"),
            }
        }
        ReplicationCommands::Cancel { job_id } => {
            let _: serde_json::Value = api.post(&format!("/api/v1/replication/jobs/{job_id}/cancel"), &serde_json::json!({})).await?;
            output::print_success(&format!("Cancel requested for job {job_id}"));
        }
    }
    Ok(())
}
