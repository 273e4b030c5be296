//! End-to-end tests for the Riptide hub
//!
//! These tests run the hub on the simulated engine: torrents make real
//! progress over time and endpoints are real HTTP listeners.

#[path = "../integration/support.rs"]
mod support;

mod simulated_hub;
