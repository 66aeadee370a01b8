//! Fleet telemetry CLI
//!
//! A command-line tool for inspecting the fleet, its alerts and stored
//! readings, and for registering machines through the daemon.

use anyhow::Result;
use clap::{Parser, Subcommand};
use fleetctl::client::{ApiClient, RegisterRequest};
use fleetctl::commands::{alerts, health, machines};
use fleetctl::output::{print_error, OutputFormat};

/// Fleet telemetry CLI
#[derive(Parser)]
#[command(name = "fleetctl")]
#[command(author, version, about = "CLI for the fleet telemetry daemon", long_about = None)]
pub struct Cli {
    /// Daemon API URL (can also be set via FLEETCTL_API_URL env var)
    #[arg(long, env = "FLEETCTL_API_URL", default_value = "http://localhost:9100")]
    pub api_url: String,

    /// Output format
    #[arg(long, short, global = true, default_value = "table")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List machines and the connection state
    Machines,

    /// List alerts, newest first
    Alerts {
        /// Only alerts for this machine ID
        #[arg(long, short)]
        machine: Option<String>,
    },

    /// Show stored readings for a machine
    History {
        /// Machine ID
        id: String,

        /// Number of most recent readings
        #[arg(long, short, default_value_t = 50)]
        limit: usize,

        /// Whole retained history, raw and aggregated
        #[arg(long)]
        full: bool,
    },

    /// Register a machine
    Register {
        #[arg(long)]
        name: String,

        /// Machine type, e.g. "CNC Mill"
        #[arg(long = "type")]
        machine_type: String,

        #[arg(long)]
        location: String,

        /// Explicit ID (generated by the daemon if omitted)
        #[arg(long)]
        id: Option<String>,

        #[arg(long)]
        image_url: Option<String>,
    },

    /// Show daemon health and readiness
    Health,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let client = ApiClient::new(&cli.api_url)?;

    match cli.command {
        Commands::Machines => machines::list_machines(&client, cli.format).await?,
        Commands::Alerts { machine } => alerts::list_alerts(&client, machine, cli.format).await?,
        Commands::History { id, limit, full } => {
            machines::show_history(&client, &id, limit, full, cli.format).await?
        }
        Commands::Register {
            name,
            machine_type,
            location,
            id,
            image_url,
        } => {
            let request = RegisterRequest {
                id,
                name,
                machine_type,
                location,
                image_url,
            };
            machines::register_machine(&client, request, cli.format).await?
        }
        Commands::Health => health::show_health(&client, cli.format).await?,
    }

    Ok(())
}
