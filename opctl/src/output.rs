//! Output formatting for the operator CLI — table/JSON per the `--output`
//! flag, matching the teacher CLI's `output.rs` idiom.

use colored::Colorize;
use serde::Serialize;
use tabled::Tabled;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

impl OutputFormat {
    pub fn from_str(value: &str) -> Self {
        match value {
            "json" => OutputFormat::Json,
            _ => OutputFormat::Table,
        }
    }
}

pub fn print_rows<T: Tabled + Serialize>(data: Vec<T>, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&data)?),
        OutputFormat::Table => {
            if data.is_empty() {
                println!("{}", "No results found".yellow());
            } else {
                println!("{}", tabled::Table::new(data));
            }
        }
    }
    Ok(())
}

pub fn print_single<T: Serialize>(data: &T, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(data)?),
        OutputFormat::Table => println!("{}", serde_json::to_string_pretty(data)?),
    }
    Ok(())
}

pub fn print_success(message: &str) {
    println!("{} {}", "\u{2713}".green().bold(), message.green());
}

pub fn print_info(message: &str) {
    println!("{} {}", "i".blue().bold(), message);
}
