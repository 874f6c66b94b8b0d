//! In-process message handling for Local mode.
//!
//! When a discovered backend instance is this gateway process itself,
//! traffic short-circuits to an embedder-supplied [`MessageHandler`]
//! instead of crossing a socket.  The handler replies through the
//! [`BackendSession`] it is handed, which feeds the normal backend→user
//! dispatch path.

use gate_proto::transfer::{BackendMsg, GatewayMsg};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// The reply channel a handler sees: everything it sends is treated as
/// if it had arrived on an uplink from a remote instance.
pub trait BackendSession: Send + Sync {
    fn send_message(&self, msg: BackendMsg);
}

/// Application-level handler for one locally served service.
pub trait MessageHandler: Send + Sync {
    fn handle_message(
        &self,
        session: &dyn BackendSession,
        msg: GatewayMsg,
    ) -> Result<(), HandlerError>;
}
