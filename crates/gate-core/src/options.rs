//! Gateway options.
//!
//! Plain values come from configuration; the trailing fields carry the
//! embedder's wiring (local handlers, selector factory, router and cache
//! overrides) and cannot be expressed in a config file.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use gate_proto::ByteOrder;

use crate::handler::MessageHandler;
use crate::router::Router;
use crate::selector::{RouterCache, Selector};

/// Builds a fresh selector for one service manager.
pub type SelectorFactory = Arc<dyn Fn() -> Box<dyn Selector> + Send + Sync>;

pub struct Options {
    /// Shared secret user handshakes must present.
    pub receiver_auth_key: String,
    /// Listen address, `tcp://host:port` or `ws://host:port`.
    pub receiver_proto_addr: String,
    /// Byte order of the user channel.
    pub receiver_byte_order: ByteOrder,

    /// Idle limit before login, milliseconds.
    pub unregistered_sender_expiration: i64,
    /// Idle limit after login, milliseconds; refreshed per heartbeat.
    pub registered_sender_expiration: i64,
    /// How often the session reaper sweeps the shard locals.
    pub clean_sender_session_cache_interval: Duration,

    /// Shard worker count; 0 means logical cores + 1.
    pub message_executor_worker_num: usize,
    /// Bounded task queue length per shard.
    pub message_executor_queue_length: usize,

    /// Read buffer capacity of an uplink.
    pub transfer_read_buffer_cap: usize,
    /// Write buffer capacity of an uplink.
    pub transfer_write_buffer_cap: usize,
    /// Socket-level receive buffer of an uplink.
    pub transfer_socket_recv_buffer: usize,
    /// Socket-level send buffer of an uplink.
    pub transfer_socket_send_buffer: usize,
    /// Bounded frame queue between senders and the uplink writer.
    pub transfer_write_queue_cap: usize,
    pub transfer_tcp_keep_alive: Duration,
    pub transfer_dial_timeout: Duration,
    /// How long a disabled instance lingers before it is stopped, ms.
    pub transfer_disable_timeout: i64,
    /// Uplink keepalive / reconnect check interval.
    pub transfer_keep_alive_interval: Duration,
    /// Encoded bodies above this size are logged.
    pub transfer_message_warning_size: usize,
    /// Shared secret between gateways and backend instances.
    pub transfer_auth_key: String,
    /// Byte order of the backend channel.
    pub transfer_byte_order: ByteOrder,

    /// Services to watch in the registry, one manager each.
    pub registry_service_names: Vec<String>,
    /// Service name → in-process handler for Local mode.
    pub service_message_handler: HashMap<String, Arc<dyn MessageHandler>>,
    /// Selector override; the default is weighted-random, preceded by a
    /// cache lookup stage when `router_cache` is set.
    pub service_selector: Option<SelectorFactory>,
    /// Router override; the default fans out / targets by instance id.
    pub service_router: Option<Arc<dyn Router>>,
    /// Sticky-session cache consulted before weighted selection.
    pub router_cache: Option<Arc<dyn RouterCache>>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            receiver_auth_key: String::new(),
            receiver_proto_addr: String::new(),
            receiver_byte_order: ByteOrder::Little,

            unregistered_sender_expiration: 15_000,
            registered_sender_expiration: 30_000,
            clean_sender_session_cache_interval: Duration::from_secs(30),

            message_executor_worker_num: 0,
            message_executor_queue_length: 1000,

            transfer_read_buffer_cap: 512 * 1024,
            transfer_write_buffer_cap: 512 * 1024,
            transfer_socket_recv_buffer: 512 * 1024,
            transfer_socket_send_buffer: 512 * 1024,
            transfer_write_queue_cap: 100,
            transfer_tcp_keep_alive: Duration::from_secs(60),
            transfer_dial_timeout: Duration::from_secs(5),
            transfer_disable_timeout: 60_000,
            transfer_keep_alive_interval: Duration::from_secs(10),
            transfer_message_warning_size: 8 * 1024,
            transfer_auth_key: String::new(),
            transfer_byte_order: ByteOrder::Big,

            registry_service_names: Vec::new(),
            service_message_handler: HashMap::new(),
            service_selector: None,
            service_router: None,
            router_cache: None,
        }
    }
}

impl Options {
    /// Effective shard worker count.
    pub fn executor_workers(&self) -> usize {
        if self.message_executor_worker_num > 0 {
            return self.message_executor_worker_num;
        }
        std::thread::available_parallelism()
            .map(|n| n.get() + 1)
            .unwrap_or(4)
    }
}
