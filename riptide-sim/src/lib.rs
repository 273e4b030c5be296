//! Riptide Simulation - Simulated torrent engine for the hub.
//!
//! Torrents "download" at a configured speed with seeded jitter, raise the
//! same events a real engine would, and expose real HTTP endpoints. Used to
//! run the hub end to end without touching the network.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use riptide_hub::{HubConfig, HubMessage, spawn_hub};
//! use riptide_sim::{SimulatedEngineFactory, SimulationConfig};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let factory = SimulatedEngineFactory::new(SimulationConfig::deterministic_testing());
//! let sink = Arc::new(|message: HubMessage| println!("{}", message.kind()));
//! let hub = spawn_hub(HubConfig::default(), factory, sink);
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod server;
pub mod torrent;

pub use config::SimulationConfig;
pub use engine::{SimulatedEngine, SimulatedEngineFactory, SimulatedSession};
pub use server::{SimulatedEndpoint, TorrentIndex};
pub use torrent::SimulatedTorrent;
