//! Alert listing

use anyhow::{Context, Result};
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{
    color_severity, format_timestamp, print_json, print_table, print_warning, OutputFormat,
};

/// Row for alerts table
#[derive(Tabled)]
struct AlertRow {
    #[tabled(rename = "Time")]
    time: String,
    #[tabled(rename = "Machine")]
    machine: String,
    #[tabled(rename = "Severity")]
    severity: String,
    #[tabled(rename = "Sensor")]
    sensor: String,
    #[tabled(rename = "Message")]
    message: String,
}

/// List alerts, newest first
pub async fn list_alerts(
    client: &ApiClient,
    machine: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let alerts = client
        .alerts(machine.as_deref())
        .await
        .context("Failed to fetch alerts")?;

    match format {
        OutputFormat::Json => print_json(&alerts)?,
        OutputFormat::Table => {
            if alerts.is_empty() {
                print_warning("No alerts");
                return Ok(());
            }

            let rows: Vec<AlertRow> = alerts
                .iter()
                .map(|a| AlertRow {
                    time: format_timestamp(a.timestamp),
                    machine: a.machine_name.clone(),
                    severity: color_severity(&a.severity),
                    sensor: match (&a.sensor_type, a.value) {
                        (Some(sensor), Some(value)) => format!("{} = {:.2}", sensor, value),
                        (Some(sensor), None) => sensor.clone(),
                        _ => "-".to_string(),
                    },
                    message: a.message.clone(),
                })
                .collect();

            print_table(rows);
            println!("\nTotal: {} alerts", alerts.len());
        }
    }

    Ok(())
}
