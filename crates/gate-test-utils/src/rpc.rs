//! Pending-request table for inter-instance RPC.
//!
//! Backend instances pair `RpcRReq`/`RpcRRes` envelopes routed through
//! the gateway.  The caller registers a waiter under a fresh rpc id; a
//! response completes it, and a timer fires a timeout if nothing comes
//! back.  A response for an unknown rpc id (late, or the caller
//! restarted) is logged and dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::warn;

pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, PartialEq, Eq)]
pub enum RpcOutcome {
    /// The peer answered with a success code.
    Response(Vec<u8>),
    /// The peer answered with an error code.
    ErrorCode(u16),
    /// Nothing came back within the timeout.
    TimedOut,
}

pub struct RpcManager {
    next_id: AtomicU32,
    pending: Arc<DashMap<u32, oneshot::Sender<RpcOutcome>>>,
    timeout: Duration,
}

impl Default for RpcManager {
    fn default() -> Self {
        Self::new(DEFAULT_RPC_TIMEOUT)
    }
}

impl RpcManager {
    pub fn new(timeout: Duration) -> Self {
        RpcManager {
            next_id: AtomicU32::new(0),
            pending: Arc::new(DashMap::new()),
            timeout,
        }
    }

    /// Allocates an rpc id and registers its waiter.  The returned
    /// receiver resolves exactly once: response, error, or timeout.
    pub fn next_request(&self) -> (u32, oneshot::Receiver<RpcOutcome>) {
        let rpc_id = self.next_id.fetch_add(1, Ordering::AcqRel) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(rpc_id, tx);
        let pending = self.pending.clone();
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some((_, waiter)) = pending.remove(&rpc_id) {
                let _ = waiter.send(RpcOutcome::TimedOut);
            }
        });
        (rpc_id, rx)
    }

    /// Completes a waiter from an `RpcRRes`.  Unknown ids are dropped
    /// with a log line; guessing at a restarted caller's table would be
    /// worse.
    pub fn complete(&self, rpc_id: u32, code: u16, payload: Vec<u8>) {
        let Some((_, waiter)) = self.pending.remove(&rpc_id) else {
            warn!(rpc_id, "rpc response with no pending request dropped");
            return;
        };
        let outcome = if code == gate_proto::transfer::code::SUCCESS {
            RpcOutcome::Response(payload)
        } else {
            RpcOutcome::ErrorCode(code)
        };
        let _ = waiter.send(outcome);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
