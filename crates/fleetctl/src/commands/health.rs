//! Daemon health

use anyhow::{Context, Result};
use colored::Colorize;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{color_status, format_timestamp, print_json, print_table, OutputFormat};

#[derive(Tabled)]
struct ComponentRow {
    #[tabled(rename = "Component")]
    name: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Message")]
    message: String,
    #[tabled(rename = "Since")]
    since: String,
}

/// Show overall and per-component health
pub async fn show_health(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let report = client
        .health()
        .await
        .context("Failed to reach the daemon")?;

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => {
            println!("{}", "Daemon Health".bold());
            println!("{}", "=".repeat(50));
            println!("Status: {}", color_status(&report.health.status));
            match report.health.fallback_since {
                Some(since) => println!(
                    "Source: {} (since {})",
                    report.health.source.yellow(),
                    format_timestamp(since)
                ),
                None => println!("Source: {}", report.health.source),
            }
            match (report.readiness.ready, &report.readiness.reason) {
                (true, _) => println!("Ready:  {}", "yes".green()),
                (false, Some(reason)) => println!("Ready:  {} ({})", "no".red(), reason),
                (false, None) => println!("Ready:  {}", "no".red()),
            }
            println!();

            let mut components: Vec<_> = report.health.components.iter().collect();
            components.sort_by(|a, b| a.0.cmp(b.0));
            let rows: Vec<ComponentRow> = components
                .into_iter()
                .map(|(name, c)| ComponentRow {
                    name: name.clone(),
                    status: color_status(&c.status),
                    message: c.message.clone().unwrap_or_default(),
                    since: format_timestamp(c.since),
                })
                .collect();
            print_table(rows);
        }
    }

    Ok(())
}
