///! opctl — operator CLI for the Hub's management API: pairing-code
///! issuance, enrolment approval, protection-group and schedule
///! administration, and failover/rollback invocation (spec §6).

mod api;
mod commands;
mod config;
mod output;

use anyhow::Result;
use api::ApiClient;
use clap::{Parser, Subcommand};
use config::Config;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Hub management API address
    #[arg(long)]
    hub: Option<String>,

    /// Output format (table, json)
    #[arg(short, long, default_value = "table")]
    output: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Node enrolment: pairing codes, approval, rejection
    Enroll {
        #[command(subcommand)]
        command: EnrollCommands,
    },
    /// Protection-group administration
    Group {
        #[command(subcommand)]
        command: GroupCommands,
    },
    /// Schedule administration
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommands,
    },
    /// Replication job control
    Replication {
        #[command(subcommand)]
        command: ReplicationCommands,
    },
    /// Failover / rollback invocation
    Failover {
        #[command(subcommand)]
        command: FailoverCommands,
    },
    /// File-level restore mounts
    Restore {
        #[command(subcommand)]
        command: RestoreCommands,
    },
    /// VM discovery helpers
    UngroupedVms,
}

#[derive(Subcommand)]
enum EnrollCommands {
    /// Issue a new pairing code
    IssueCode,
    /// Approve a pending enrolment
    Approve { enrollment_id: String },
    /// Reject a pending enrolment
    Reject { enrollment_id: String },
}

#[derive(Subcommand)]
enum GroupCommands {
    /// Create a protection group
    Create {
        name: String,
        #[arg(long, default_value_t = 1)]
        max_concurrent_vms: u32,
        #[arg(long, default_value = "opctl")]
        created_by: String,
        #[arg(long)]
        schedule_id: Option<String>,
    },
    /// List protection groups
    List,
    /// Add a VM context to a group
    AddMember {
        group_id: String,
        context_id: String,
        #[arg(long)]
        priority: Option<i32>,
    },
}

#[derive(Subcommand)]
enum ScheduleCommands {
    /// Create a cron-driven schedule
    Create { name: String, cron_expression: String },
    /// List enabled schedules
    List,
}

#[derive(Subcommand)]
enum ReplicationCommands {
    /// Start a replication job for a VM context
    Start { context_id: String },
    /// Show a job's stored state
    Show { job_id: String },
    /// Show a job's live progress
    Progress { job_id: String },
    /// Request cancellation of a running job
    Cancel { job_id: String },
}

#[derive(Subcommand)]
enum FailoverCommands {
    /// Start a unified test or live failover
    Start {
        context_id: String,
        #[arg(long, default_value = "test")]
        mode: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Roll back a failover
    Rollback {
        failover_id: String,
        #[arg(long, default_value_t = true)]
        power_on_source: bool,
        #[arg(long, default_value_t = false)]
        force_cleanup: bool,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Show a failover job's stored state
    Status { failover_id: String },
    /// Show completed phases and current status
    Progress { failover_id: String },
}

#[derive(Subcommand)]
enum RestoreCommands {
    /// Mount a backup for file-level restore
    Mount {
        backup_id: String,
        mount_path: String,
        #[arg(long, default_value = "ext4")]
        filesystem_type: String,
        #[arg(long, default_value_t = false)]
        rw: bool,
        #[arg(long)]
        ttl_seconds: Option<i64>,
    },
    /// List active restore mounts
    List,
    /// Show one mount's stored state
    Show { mount_id: String },
    /// Unmount a restore mount
    Unmount { mount_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load().unwrap_or_default();
    let hub_url = cli.hub.unwrap_or(config.hub_url);
    let output_format = if cli.output == "table" { config.output.clone() } else { cli.output.clone() };
    let api = ApiClient::new(&hub_url);

    match cli.command {
        Commands::Enroll { command } => commands::enroll::handle(command, &api, &output_format).await,
        Commands::Group { command } => commands::groups::handle(command, &api, &output_format).await,
        Commands::Schedule { command } => commands::schedules::handle(command, &api, &output_format).await,
        Commands::Replication { command } => commands::replication::handle(command, &api, &output_format).await,
        Commands::Failover { command } => commands::failover::handle(command, &api, &output_format).await,
        Commands::Restore { command } => commands::restore::handle(command, &api, &output_format).await,
        Commands::UngroupedVms => commands::discovery::handle_ungrouped(&api, &output_format).await,
    }
}
