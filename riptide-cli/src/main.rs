//! Riptide CLI - Command-line interface
//!
//! Runs a hub over a JSON-lines transport: one client message per line on
//! stdin, one hub message per line on stdout. Logs go to stderr.

mod commands;

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "riptide")]
#[command(about = "Shared torrent sessions for many remote clients")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    commands::handle_command(cli.command).await
}
