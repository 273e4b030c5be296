//! Integration tests for the Riptide hub
//!
//! These tests drive a spawned hub through its public handle with the mock
//! engine and observe everything it sends back through the message sink.

#[path = "integration/support.rs"]
mod support;

#[path = "integration/dedupe_properties.rs"]
mod dedupe_properties;
#[path = "integration/endpoint_coalescing.rs"]
mod endpoint_coalescing;
#[path = "integration/liveness.rs"]
mod liveness;
#[path = "integration/protocol_dispatch.rs"]
mod protocol_dispatch;
#[path = "integration/session_lifecycle.rs"]
mod session_lifecycle;
