//! CLI command implementations

use std::time::Duration;

use anyhow::Context;
use clap::{Args, Subcommand};
use riptide_hub::protocol::channel_sink;
use riptide_hub::{ContentId, HubConfig, HubError, HubHandle, HubMessage, spawn_hub};
use riptide_sim::{SimulatedEngineFactory, SimulationConfig};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run a hub with the simulated engine over stdin/stdout JSON lines
    Serve(ServeArgs),
    /// Print the content identity of a magnet link or info hash
    Parse {
        /// Magnet link or 40-character hex info hash
        identifier: String,
    },
}

/// Flags for `riptide serve`, layered over `RIPTIDE_*` environment variables
#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Milliseconds without a heartbeat before a client is dropped (0 disables)
    #[arg(long)]
    pub heartbeat_timeout_ms: Option<u64>,
    /// Milliseconds between liveness sweeps and update broadcasts (0 disables)
    #[arg(long)]
    pub sweep_interval_ms: Option<u64>,
    /// Minimum milliseconds between download/upload messages per torrent
    #[arg(long)]
    pub progress_throttle_ms: Option<u64>,
    /// Seed for the simulated engine
    #[arg(long)]
    pub seed: Option<u64>,
    /// Simulated download speed in bytes per second
    #[arg(long)]
    pub download_speed: Option<u64>,
    /// Milliseconds between simulated progress steps
    #[arg(long)]
    pub tick_ms: Option<u64>,
    /// Interface simulated endpoints bind to
    #[arg(long)]
    pub listen_host: Option<String>,
}

impl ServeArgs {
    /// Applies flags on top of an environment-derived hub configuration.
    pub fn hub_config(&self, mut config: HubConfig) -> HubConfig {
        if let Some(ms) = self.heartbeat_timeout_ms {
            config.heartbeat_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.sweep_interval_ms {
            config.sweep_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.progress_throttle_ms {
            config.progress_throttle = Duration::from_millis(ms);
        }
        config
    }

    pub fn simulation_config(&self) -> SimulationConfig {
        let mut config = SimulationConfig {
            deterministic_seed: self.seed,
            ..Default::default()
        };
        if let Some(speed) = self.download_speed {
            config.simulated_download_speed = speed;
        }
        if let Some(ms) = self.tick_ms {
            config.tick_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(host) = &self.listen_host {
            config.listen_host = host.clone();
        }
        config
    }
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Serve(args) => serve(args).await,
        Commands::Parse { identifier } => {
            let content_id = ContentId::from_identifier(&identifier)?;
            println!("{content_id}");
            Ok(())
        }
    }
}

/// Runs the hub until stdin closes or Ctrl-C.
///
/// # Errors
/// - Invalid `RIPTIDE_*` environment variables
/// - stdin/stdout failures
pub async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let hub_config = args.hub_config(HubConfig::from_env()?);
    let factory = SimulatedEngineFactory::new(args.simulation_config());

    let (outbound, outbox) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_messages(outbox));
    let hub = spawn_hub(hub_config.clone(), factory, channel_sink(outbound));
    tracing::info!(
        "Hub started (heartbeat timeout {:?}, sweep interval {:?})",
        hub_config.heartbeat_timeout,
        hub_config.sweep_interval
    );

    tokio::select! {
        result = read_messages(&hub) => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted"),
    }

    if let Err(e) = hub.shutdown().await {
        tracing::debug!("Hub already stopped: {}", e);
    }
    drop(hub);
    writer.await.context("stdout writer panicked")??;
    tracing::info!("Hub stopped");

    Ok(())
}

/// Feeds stdin lines into the hub until EOF.
async fn read_messages(hub: &HubHandle) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match hub.dispatch_json(line).await {
            Ok(()) => {}
            Err(HubError::HubShutdown) => break,
            // Already logged by the handle
            Err(e) if e.is_client_error() => {}
            Err(e) => return Err(e.into()),
        }
    }

    tracing::debug!("stdin closed");
    Ok(())
}

/// Writes every outbound message as one JSON line until the hub drops
/// its sink.
async fn write_messages(mut outbox: mpsc::UnboundedReceiver<HubMessage>) -> anyhow::Result<()> {
    let mut stdout = tokio::io::stdout();

    while let Some(message) = outbox.recv().await {
        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');
        stdout.write_all(&line).await.context("writing stdout")?;
        stdout.flush().await?;
    }

    Ok(())
}
