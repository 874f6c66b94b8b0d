//! Gateway configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/gatehouse/gateway.toml`.
//!
//! # Required fields
//! - `app.id`
//! - `receiver.proto_addr`
//! - At least one entry in `transfer.services`
//!
//! Everything else falls back to the library defaults.

use std::path::Path;

use serde::Deserialize;
use std::time::Duration;

use gate_core::{AppInfo, Options};

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub app: AppInfo,
    pub options: ResolvedOptions,
    /// Statically configured backend instances (used when no external
    /// naming service is wired in).
    pub static_instances: Vec<StaticInstance>,
}

/// The plain-value subset of [`Options`]; the embedder wiring (local
/// handlers, selector overrides) cannot come from a file.
#[derive(Debug, Clone)]
pub struct ResolvedOptions {
    pub receiver_auth_key: String,
    pub receiver_proto_addr: String,
    pub unregistered_sender_expiration: i64,
    pub registered_sender_expiration: i64,
    pub clean_interval_secs: u64,
    pub executor_workers: usize,
    pub executor_queue_length: usize,
    pub transfer_auth_key: String,
    pub transfer_dial_timeout_secs: u64,
    pub transfer_disable_timeout_ms: i64,
    pub transfer_keep_alive_secs: u64,
    pub services: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticInstance {
    pub service: String,
    pub id: String,
    pub ip: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl GatewayConfig {
    /// Turns the resolved config into library [`Options`].
    pub fn to_options(&self) -> Options {
        let r = &self.options;
        Options {
            receiver_auth_key: r.receiver_auth_key.clone(),
            receiver_proto_addr: r.receiver_proto_addr.clone(),
            unregistered_sender_expiration: r.unregistered_sender_expiration,
            registered_sender_expiration: r.registered_sender_expiration,
            clean_sender_session_cache_interval: Duration::from_secs(r.clean_interval_secs),
            message_executor_worker_num: r.executor_workers,
            message_executor_queue_length: r.executor_queue_length,
            transfer_auth_key: r.transfer_auth_key.clone(),
            transfer_dial_timeout: Duration::from_secs(r.transfer_dial_timeout_secs),
            transfer_disable_timeout: r.transfer_disable_timeout_ms,
            transfer_keep_alive_interval: Duration::from_secs(r.transfer_keep_alive_secs),
            registry_service_names: r.services.clone(),
            ..Options::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    app: Option<RawApp>,
    receiver: Option<RawReceiver>,
    transfer: Option<RawTransfer>,
    executor: Option<RawExecutor>,
    #[serde(default)]
    instances: Vec<StaticInstance>,
}

#[derive(Debug, Deserialize)]
struct RawApp {
    id: Option<String>,
    cluster: Option<String>,
    group: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawReceiver {
    proto_addr: Option<String>,
    auth_key: Option<String>,
    unregistered_expiration_ms: Option<i64>,
    registered_expiration_ms: Option<i64>,
    clean_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawTransfer {
    auth_key: Option<String>,
    services: Option<Vec<String>>,
    dial_timeout_secs: Option<u64>,
    disable_timeout_ms: Option<i64>,
    keep_alive_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawExecutor {
    workers: Option<usize>,
    queue_length: Option<usize>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("parse: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required field {0}")]
    Missing(&'static str),
}

pub fn load(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse(&text)
}

pub fn parse(text: &str) -> Result<GatewayConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(text)?;
    let app = raw.app.ok_or(ConfigError::Missing("app"))?;
    let receiver = raw.receiver.ok_or(ConfigError::Missing("receiver"))?;
    let transfer = raw.transfer.unwrap_or(RawTransfer {
        auth_key: None,
        services: None,
        dial_timeout_secs: None,
        disable_timeout_ms: None,
        keep_alive_secs: None,
    });
    let executor = raw.executor.unwrap_or(RawExecutor {
        workers: None,
        queue_length: None,
    });

    let services = transfer.services.unwrap_or_default();
    if services.is_empty() {
        return Err(ConfigError::Missing("transfer.services"));
    }

    Ok(GatewayConfig {
        app: AppInfo {
            id: app.id.ok_or(ConfigError::Missing("app.id"))?,
            cluster: app.cluster.unwrap_or_default(),
            group: app.group.unwrap_or_default(),
        },
        options: ResolvedOptions {
            receiver_auth_key: receiver.auth_key.unwrap_or_default(),
            receiver_proto_addr: receiver
                .proto_addr
                .ok_or(ConfigError::Missing("receiver.proto_addr"))?,
            unregistered_sender_expiration: receiver.unregistered_expiration_ms.unwrap_or(15_000),
            registered_sender_expiration: receiver.registered_expiration_ms.unwrap_or(30_000),
            clean_interval_secs: receiver.clean_interval_secs.unwrap_or(30),
            executor_workers: executor.workers.unwrap_or(0),
            executor_queue_length: executor.queue_length.unwrap_or(1000),
            transfer_auth_key: transfer.auth_key.unwrap_or_default(),
            transfer_dial_timeout_secs: transfer.dial_timeout_secs.unwrap_or(5),
            transfer_disable_timeout_ms: transfer.disable_timeout_ms.unwrap_or(60_000),
            transfer_keep_alive_secs: transfer.keep_alive_secs.unwrap_or(10),
            services,
        },
        static_instances: raw.instances,
    })
}
