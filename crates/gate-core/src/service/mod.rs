//! Backend service instances.
//!
//! One [`Service`] per discovered backend instance.  [`Remote`] owns a
//! persistent outbound uplink with a connect/disable/stop state machine;
//! [`Local`] short-circuits to an in-process handler when the instance
//! id equals this gateway's own app id.

mod conn;
mod local;
mod remote;

pub use local::Local;
pub use remote::Remote;

use std::sync::atomic::{AtomicU8, Ordering};

use gate_proto::transfer::GatewayMsg;

use crate::error::ServiceError;
use crate::registry::InstanceInfo;

/// Lifecycle of a remote instance.  `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceState {
    Initialized = 0,
    Connecting = 1,
    Connected = 2,
    Disabled = 3,
    Stopped = 4,
}

impl ServiceState {
    fn from_u8(v: u8) -> ServiceState {
        match v {
            0 => ServiceState::Initialized,
            1 => ServiceState::Connecting,
            2 => ServiceState::Connected,
            3 => ServiceState::Disabled,
            _ => ServiceState::Stopped,
        }
    }
}

/// Atomic state cell with compare-and-swap transitions, so concurrent
/// updates are detected instead of silently clobbered.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(state: ServiceState) -> Self {
        StateCell(AtomicU8::new(state as u8))
    }

    pub(crate) fn load(&self) -> ServiceState {
        ServiceState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, state: ServiceState) {
        self.0.store(state as u8, Ordering::Release);
    }

    pub(crate) fn compare_swap(&self, from: ServiceState, to: ServiceState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// A backend instance, remote or in-process.
pub enum Service {
    Remote(Remote),
    Local(Local),
}

impl Service {
    /// Applies a registry update to the instance.  The identity (service
    /// id, address) must match; flag changes drive the state machine.
    pub fn update_info(&self, info: InstanceInfo) -> Result<(), ServiceError> {
        match self {
            Service::Remote(r) => r.update_info(info),
            Service::Local(l) => l.update_info(info),
        }
    }

    pub fn info(&self) -> InstanceInfo {
        match self {
            Service::Remote(r) => r.info(),
            Service::Local(l) => l.info(),
        }
    }

    /// One keepalive tick.  Returns false when the instance is stopped
    /// and should be removed from its manager.
    pub fn keep_alive(&self) -> bool {
        match self {
            Service::Remote(r) => r.keep_alive(),
            Service::Local(l) => l.keep_alive(),
        }
    }

    pub fn send_message(&self, msg: GatewayMsg) -> Result<(), ServiceError> {
        match self {
            Service::Remote(r) => r.send_message(&msg),
            Service::Local(l) => l.send_message(msg),
        }
    }

    /// Forwards already-framed bytes as-is (routing fan-out path).
    pub fn transfer_message(&self, payload: &[u8]) -> Result<(), ServiceError> {
        match self {
            Service::Remote(r) => r.transfer_message(payload),
            Service::Local(l) => l.transfer_message(payload),
        }
    }

    pub fn is_enable(&self) -> bool {
        match self {
            Service::Remote(r) => r.is_enable(),
            Service::Local(l) => l.is_enable(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        match self {
            Service::Remote(r) => r.is_stopped(),
            Service::Local(l) => l.is_stopped(),
        }
    }

    pub fn stop(&self) -> Result<(), ServiceError> {
        match self {
            Service::Remote(r) => r.stop(),
            Service::Local(l) => l.stop(),
        }
    }
}
