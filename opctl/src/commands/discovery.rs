//! Discovery helpers: listing VM contexts that aren't yet in a protection
//! group (spec §6 `/api/v1/discovery/ungrouped-vms`).

use crate::api::ApiClient;
use crate::output::{self, OutputFormat};
use anyhow::Result;
use common::VmContext;
use serde::Serialize;
use tabled::Tabled;

#[derive(Tabled, Serialize)]
struct ContextRow {
    context_id: String,
    display_name: String,
    vcenter_host: String,
    current_status: String,
}

impl From<VmContext> for ContextRow {
    fn from(c: VmContext) -> Self {
        Self {
            context_id: c.context_id,
            display_name: c.display_name,
            vcenter_host: c.vcenter_host,
            current_status: format!("{:?}", c.current_status),
        }
    }
}

pub async fn handle_ungrouped(api: &ApiClient, output_format: &str) -> Result<()> {
    let contexts: Vec<VmContext> = api.get("/api/v1/discovery/ungrouped-vms").await?;
    let rows: Vec<ContextRow> = contexts.into_iter().map(ContextRow::from).collect();
    output::print_rows(rows, OutputFormat::from_str(output_format))
}
