// gate-test-utils: Test doubles and backend-side helpers.
//
// - an in-memory naming registry whose updates can be pushed by tests,
// - a scriptable mock backend instance speaking the backend dialect
//   over TCP, answering login/echo traffic,
// - user clients (TCP and WebSocket) speaking the user dialect,
// - the app-level test message set, and
// - the RPC pending-request table backend instances pair with router
//   envelopes.

pub mod app_msg;
pub mod memory_registry;
pub mod mock_backend;
pub mod rpc;
pub mod user_client;

use std::collections::HashMap;
use std::net::SocketAddr;

use gate_core::registry::{InstanceInfo, METADATA_KEY_ID};

/// Builds a healthy, enabled instance record for tests.
pub fn instance(service: &str, id: &str, addr: SocketAddr, weight: u32) -> InstanceInfo {
    InstanceInfo {
        service_name: service.to_owned(),
        ip: addr.ip().to_string(),
        port: addr.port(),
        weight,
        healthy: true,
        enable: true,
        cluster: String::new(),
        metadata: HashMap::from([(METADATA_KEY_ID.to_owned(), id.to_owned())]),
    }
}
