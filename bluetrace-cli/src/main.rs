//! ## bluetrace-cli
//! **Operator interface for the Bluetooth capture supervisor**
//!
//! Starts the always-on sources, binds a controller interface on request and
//! streams the packet dump to stdout. Operator commands are read from stdin.

use clap::Parser;
use bluetrace_telemetry::{EventLogger, MetricsRecorder};

mod commands;

use commands::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = commands::load_config(cli.config.as_deref())?;
    EventLogger::init(&config.telemetry.log_level);
    let metrics = MetricsRecorder::new();

    match cli.command {
        Commands::Interfaces => commands::list_interfaces(&config),
        Commands::Run(run_args) => commands::run(run_args, config, metrics).await,
        Commands::Config => commands::print_config(&config),
    }
}
