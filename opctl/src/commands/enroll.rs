//! Pairing-code issuance and enrolment approval/rejection (spec §4.L2).

use crate::api::ApiClient;
use crate::output::{self, OutputFormat};
use crate::EnrollCommands;
use anyhow::Result;
use common::PairingCode;

pub async fn handle(command: EnrollCommands, api: &ApiClient, output_format: &str) -> Result<()> {
    let format = OutputFormat::from_str(output_format);
    match command {
        EnrollCommands::IssueCode => {
            let code: PairingCode = api.post("/api/v1/pairing-codes", &serde_json::json!({})).await?;
            output::print_single(&code, format)?;
            output::print_info(&format!("Pairing code {} expires at {}", code.code, code.expires_at));
        }
        EnrollCommands::Approve { enrollment_id } => {
            let _: serde_json::Value = api.post(&format!("/api/v1/enrollments/{enrollment_id}/approve"), &serde_json::json!({})).await?;
            output::print_success(&format!("Enrollment {enrollment_id} approved"));
        }
        EnrollCommands::Reject { enrollment_id } => {
            let _: serde_json::Value = api.post(&format!("/api/v1/enrollments/{enrollment_id}/reject"), &serde_json::json!({})).await?;
            output::print_success(&format!("Enrollment {enrollment_id} rejected"));
        }
    }
    Ok(())
}
