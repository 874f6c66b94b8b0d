// gate-core: The stateful engine of the gateway.
//
// The gateway terminates many long-lived user connections, binds each
// session to one live backend instance discovered through a naming
// registry, keeps a multiplexed persistent uplink per instance, and
// relays typed messages in both directions without reordering traffic
// within a connection.
//
// Concurrency model: a fixed pool of single-threaded shard workers.  A
// connection id hashes to exactly one shard, all per-session state lives
// in that shard's local map, and every touch of a user session goes
// through `Transfer::forward`.  Cross-cutting work (instance
// reconciliation, selection, routing fan-out) runs on shard 0 or on
// detached tasks, never inline on registry or socket callbacks.

mod dispatch;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod handler;
pub mod manager;
pub mod options;
pub mod receiver;
pub mod registry;
pub mod router;
pub mod selector;
pub mod service;
pub mod session;
pub mod transfer;

pub use error::{ExecutorError, GatewayError, RegistryError, SelectorError, ServiceError};
pub use gateway::Gateway;
pub use options::Options;
pub use registry::{AppInfo, InstanceInfo, Registry, RegistryCallback, ServiceQuery};

/// Milliseconds since the unix epoch, the clock all deadlines use.
pub(crate) fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
