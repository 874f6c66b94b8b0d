//! User session handles and the per-session sender context.
//!
//! A [`UserSession`] is the cheap, cloneable handle stored in a shard
//! local and passed around dispatch tasks; the socket I/O itself lives
//! in the receiver's reader/writer tasks.  Outbound messages go through
//! a bounded queue; the writer task owns the socket.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use gate_proto::user::ServerMsg;

use crate::now_millis;
use crate::service::Service;

#[derive(Clone)]
pub struct UserSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    conn_id: u64,
    out_tx: mpsc::Sender<ServerMsg>,
    closed: AtomicBool,
    cancel: CancellationToken,
    ctx: SenderContext,
}

impl UserSession {
    pub fn new(
        conn_id: u64,
        out_tx: mpsc::Sender<ServerMsg>,
        cancel: CancellationToken,
        ctx: SenderContext,
    ) -> Self {
        UserSession {
            inner: Arc::new(SessionInner {
                conn_id,
                out_tx,
                closed: AtomicBool::new(false),
                cancel,
                ctx,
            }),
        }
    }

    pub fn conn_id(&self) -> u64 {
        self.inner.conn_id
    }

    pub fn ctx(&self) -> &SenderContext {
        &self.inner.ctx
    }

    /// Queues a message toward the user.  Overflow and races with close
    /// are logged and dropped; the session's fate is the reaper's call.
    pub fn send_message(&self, msg: ServerMsg) {
        if self.is_closed() {
            return;
        }
        if let Err(e) = self.inner.out_tx.try_send(msg) {
            warn!(conn_id = self.inner.conn_id, error = %e, "dropping outbound user message");
        }
    }

    /// Asks the I/O tasks to wind the connection down.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.cancel.cancel();
    }

    /// Marks the session closed without cancelling; used by the I/O side
    /// when the peer disconnected on its own.
    pub fn mark_closed(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire) || self.inner.cancel.is_cancelled()
    }
}

/// Per-user-session state kept on the gateway.
///
/// `registered` flips true at most once, when a backend confirms login.
/// Before that the idle deadline is fixed at session open; after, each
/// heartbeat refreshes it.
pub struct SenderContext {
    registered: AtomicBool,
    deadline: AtomicI64,
    registered_ttl: i64,
    bindings: std::sync::RwLock<Bindings>,
}

#[derive(Default)]
struct Bindings {
    default: Option<(String, Arc<Service>)>,
    extra: HashMap<String, Arc<Service>>,
}

impl SenderContext {
    pub fn new(unregistered_ttl: i64, registered_ttl: i64) -> Self {
        SenderContext {
            registered: AtomicBool::new(false),
            deadline: AtomicI64::new(now_millis() + unregistered_ttl),
            registered_ttl,
            bindings: std::sync::RwLock::new(Bindings::default()),
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// Monotonic: the first successful registration wins, later calls
    /// are no-ops.
    pub fn set_registered(&self) {
        if self
            .registered
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.deadline
                .store(now_millis() + self.registered_ttl, Ordering::Release);
        }
    }

    pub fn deadline(&self) -> i64 {
        self.deadline.load(Ordering::Acquire)
    }

    /// Refreshes the idle deadline.  Before registration the deadline is
    /// fixed, so this is a no-op.
    pub fn update_deadline(&self) {
        if !self.is_registered() {
            return;
        }
        self.deadline
            .store(now_millis() + self.registered_ttl, Ordering::Release);
    }

    /// Binds a service.  The first binding becomes the default.
    pub fn set_service(&self, name: &str, service: Arc<Service>) {
        let mut b = self.bindings.write().expect("sender bindings lock");
        if b.default.is_none() {
            b.default = Some((name.to_owned(), service));
        } else {
            b.extra.insert(name.to_owned(), service);
        }
    }

    pub fn service(&self, name: &str) -> Option<Arc<Service>> {
        let b = self.bindings.read().expect("sender bindings lock");
        if let Some((dname, srv)) = &b.default {
            if dname == name {
                return Some(srv.clone());
            }
        }
        b.extra.get(name).cloned()
    }

    pub fn default_service(&self) -> Option<(String, Arc<Service>)> {
        self.bindings
            .read()
            .expect("sender bindings lock")
            .default
            .clone()
    }
}
