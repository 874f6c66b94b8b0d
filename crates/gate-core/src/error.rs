//! Error types, grouped by failure domain.
//!
//! Per-message errors never tear the gateway down; they are logged with
//! service id / connection id / router id context and the affected
//! message is dropped or answered with an error code.  Only startup
//! errors ([`GatewayError`]) abort the process.

use thiserror::Error;

/// Failures of a backend service instance operation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ServiceError {
    /// The instance has never been connected; connect first.
    #[error("connect client first")]
    NotConnected,
    /// A dial is in flight; retry after it settles.
    #[error("client is connecting")]
    ConnectingClient,
    /// The uplink handshake has not completed.
    #[error("obtain certification first")]
    NoCertification,
    /// The instance is administratively disabled.
    #[error("service is disabled")]
    DisabledService,
    /// Terminal: the instance was stopped.
    #[error("instance is stopped")]
    StoppedInstance,
    /// A connect attempt landed inside the backoff window.
    #[error("reconnection is too frequent")]
    FrequentReconnection,
    /// An update named a different instance identity.
    #[error("invalid instance parameters")]
    InvalidParams,
    /// The uplink write queue is full.
    #[error("uplink write queue is full")]
    WriteQueueFull,
    #[error("codec: {0}")]
    Codec(#[from] gate_proto::CodecError),
    /// An in-process message handler failed.
    #[error("handler: {0}")]
    Handler(String),
}

/// Failures of the sharded executor.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExecutorError {
    /// The target shard's queue is at capacity.
    #[error("shard queue is full")]
    QueueFull,
    /// The executor has been shut down.
    #[error("executor is stopped")]
    Stopped,
}

/// Failures of instance selection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectorError {
    /// The selector holds no instances at all.
    #[error("no service instances")]
    EmptyInstances,
    /// A cache or custom stage failed.
    #[error("selector stage: {0}")]
    Stage(String),
}

/// Failure reported by a naming registry.
#[derive(Debug, Error)]
#[error("registry: {0}")]
pub struct RegistryError(pub String);

/// Startup and lifecycle failures of the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid listen address {0:?}")]
    InvalidListenAddr(String),
    #[error("unsupported listen protocol {0:?}")]
    UnsupportedProto(String),
    #[error("bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("gateway already started")]
    AlreadyStarted,
}
