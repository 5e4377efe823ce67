//! cogs CLI
//!
//! Command-line client for the cogsd GPU claim broker.

mod client;
mod commands;

use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use crate::client::{ApiClient, Server, DEFAULT_SERVER};

/// cogs - claim GPUs on this node
#[derive(Parser, Debug)]
#[command(name = "cogs")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Daemon address, unix:///path or http://host:port
    #[arg(short, long, env = "COGS_SERVER", default_value = DEFAULT_SERVER, global = true)]
    server: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show devices, claims and processes as JSON
    Status,

    /// Claim devices and print them, or run a command with them
    Claim {
        /// Number of devices
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,

        /// Seconds to wait for free devices (0 fails at once, negative waits forever)
        #[arg(short, long, default_value_t = 1.0, allow_negative_numbers = true)]
        timeout: f64,

        /// Environment variable receiving the device list
        #[arg(short = 'e', long = "env", default_value = "CUDA_VISIBLE_DEVICES")]
        variable: String,

        /// Command to run with the claimed devices
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// Release devices you hold
    Release {
        /// Device numbers
        #[arg(required = true)]
        devices: Vec<u32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let client = ApiClient::new(Server::parse(&cli.server)?);

    match cli.command {
        Commands::Status => {
            commands::status(&client).await?;
        }
        Commands::Claim {
            count,
            timeout,
            variable,
            command,
        } => {
            commands::claim(&client, count, timeout, &variable, command).await?;
        }
        Commands::Release { devices } => {
            commands::release(&client, devices).await?;
        }
    }

    Ok(())
}
