//! Machine-related CLI commands

use anyhow::{Context, Result};
use colored::Colorize;
use tabled::Tabled;

use crate::client::{ApiClient, Machine, RegisterRequest};
use crate::output::{
    color_status, format_timestamp, print_json, print_success, print_table, print_warning,
    OutputFormat,
};

/// Row for machines table
#[derive(Tabled)]
struct MachineRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Type")]
    machine_type: String,
    #[tabled(rename = "Location")]
    location: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Vibration")]
    vibration: String,
    #[tabled(rename = "Temp")]
    temperature: String,
    #[tabled(rename = "Last Reading")]
    last_reading: String,
}

impl From<&Machine> for MachineRow {
    fn from(m: &Machine) -> Self {
        let latest = m.history.last();
        Self {
            id: m.id.clone(),
            name: m.name.clone(),
            machine_type: m.machine_type.clone(),
            location: m.location.clone(),
            status: color_status(&m.status),
            vibration: latest.map_or("-".into(), |r| format!("{:.2} mm/s", r.vibration)),
            temperature: latest.map_or("-".into(), |r| format!("{:.1} °C", r.temperature)),
            last_reading: latest.map_or("-".into(), |r| format_timestamp(r.timestamp)),
        }
    }
}

/// Row for reading history table
#[derive(Tabled)]
struct ReadingRow {
    #[tabled(rename = "Time")]
    time: String,
    #[tabled(rename = "Vibration")]
    vibration: String,
    #[tabled(rename = "Temp")]
    temperature: String,
    #[tabled(rename = "Noise")]
    noise: String,
    #[tabled(rename = "RPM")]
    rpm: String,
    #[tabled(rename = "Power")]
    power: String,
    #[tabled(rename = "Kind")]
    kind: String,
}

/// List the fleet with its connection state
pub async fn list_machines(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let view = client
        .machines()
        .await
        .context("Failed to fetch machines")?;

    match format {
        OutputFormat::Json => print_json(&view)?,
        OutputFormat::Table => {
            let source = if view.connected { "live" } else { "simulated" };
            println!(
                "Connection: {} ({})",
                color_status(&view.connection_state),
                source.cyan()
            );
            println!("Updated:    {}", format_timestamp(view.updated_at));
            println!();

            if view.machines.is_empty() {
                print_warning("No machines in the fleet");
                return Ok(());
            }

            print_table(view.machines.iter().map(MachineRow::from).collect());
            println!("\nTotal: {} machines", view.machines.len());
        }
    }

    Ok(())
}

/// Show stored readings for one machine
pub async fn show_history(
    client: &ApiClient,
    machine_id: &str,
    limit: usize,
    full: bool,
    format: OutputFormat,
) -> Result<()> {
    let readings = client
        .history(machine_id, limit, full)
        .await
        .with_context(|| format!("Failed to fetch history for {}", machine_id))?;

    match format {
        OutputFormat::Json => print_json(&readings)?,
        OutputFormat::Table => {
            println!("{}", "Reading History".bold());
            println!("{}", "=".repeat(60));
            println!("Machine: {}", machine_id.cyan());
            println!();

            if readings.is_empty() {
                print_warning("No readings stored for this machine");
                return Ok(());
            }

            let aggregated = readings.iter().filter(|r| r.is_aggregated).count();
            let rows: Vec<ReadingRow> = readings
                .iter()
                .map(|r| ReadingRow {
                    time: format_timestamp(r.reading.timestamp),
                    vibration: format!("{:.2}", r.reading.vibration),
                    temperature: format!("{:.1}", r.reading.temperature),
                    noise: format!("{:.1}", r.reading.noise),
                    rpm: format!("{:.0}", r.reading.rpm),
                    power: format!("{:.2}", r.reading.power_usage),
                    kind: if r.is_aggregated {
                        "rollup".dimmed().to_string()
                    } else {
                        "raw".to_string()
                    },
                })
                .collect();

            print_table(rows);
            println!(
                "\nTotal: {} readings ({} aggregated)",
                readings.len(),
                aggregated
            );
        }
    }

    Ok(())
}

/// Register a machine through the daemon
pub async fn register_machine(
    client: &ApiClient,
    request: RegisterRequest,
    format: OutputFormat,
) -> Result<()> {
    let machine = client
        .register(&request)
        .await
        .context("Failed to register machine")?;

    match format {
        OutputFormat::Json => print_json(&machine)?,
        OutputFormat::Table => {
            print_success(&format!("Registered {} ({})", machine.name, machine.id.cyan()));
            println!("Type:     {}", machine.machine_type);
            println!("Location: {}", machine.location);
            println!("Status:   {}", color_status(&machine.status));
        }
    }

    Ok(())
}
