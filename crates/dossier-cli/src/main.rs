mod commands;

use anyhow::Result;
use clap::Parser;
use commands::{handle_command, Command, Output};
use std::io;
use tracing_subscriber::EnvFilter;

const LOG_LEVEL_ENV: &str = "DOSSIER_LOG_LEVEL";

#[derive(Parser)]
#[command(name = "dossier")]
#[command(about = "Coordinate workers on a shared investigation case", long_about = None)]
struct Cli {
    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

fn init_logging() {
    let level = std::env::var(LOG_LEVEL_ENV).unwrap_or_else(|_| "warn".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    handle_command(cli.command, Output { json: cli.json })
}
