//! Remote backend instance: persistent uplink with reconnect backoff.
//!
//! State machine:
//!
//! ```text
//! Initialized ──connect()──▶ Connecting ──dial ok──▶ Connected ──handshake ok──▶ (Connected, certified)
//!      ▲                         │
//!      │                 dial err / cancel
//!      │◀────────────────────────┘
//!  Disabled ◀── info.enable = false ── any state except Stopped
//!  Disabled ──deadline expired──▶ Stopped (terminal)
//! ```
//!
//! Application messages only flow while Connected *and* certified; the
//! handshake is resent by the keepalive tick until the peer accepts it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use gate_proto::segment::{SegmentBuffer, SegmentPush};
use gate_proto::transfer::{BackendMsg, GatewayMsg};

use crate::dispatch;
use crate::error::ServiceError;
use crate::now_millis;
use crate::options::Options;
use crate::registry::{AppInfo, InstanceInfo};
use crate::service::conn::{Conn, spawn_conn};
use crate::service::{ServiceState, StateCell};
use crate::transfer::TransferInner;

/// Reconnect backoff, indexed by `reconnect_lvl % 5`.
const RECONNECT_INTERVAL_MS: [i64; 5] = [2_000, 2_000, 4_000, 8_000, 10_000];

pub(crate) fn reconnect_interval_ms(lvl: u32) -> i64 {
    RECONNECT_INTERVAL_MS[lvl as usize % RECONNECT_INTERVAL_MS.len()]
}

#[derive(Clone)]
pub struct Remote {
    inner: Arc<RemoteInner>,
}

struct RemoteInner {
    transfer: Weak<TransferInner>,
    options: Arc<Options>,
    app_info: AppInfo,
    info: RwLock<InstanceInfo>,
    state: StateCell,
    certified: AtomicBool,
    /// When Disabled: the instant the instance becomes Stopped.
    deadline: AtomicI64,
    conn: RwLock<Option<Conn>>,
    connect_ctx: ConnectContext,
    /// Sessions already registered against this instance, replayed in
    /// the handshake so a reconnect can resume them.
    resume: Mutex<ResumeSets>,
}

#[derive(Default)]
struct ResumeSets {
    conn_ids: HashSet<u64>,
    router_ids: HashSet<String>,
}

/// Serializes dials: one cancellable dial at a time, backoff between
/// attempts, and a generation counter so a superseded dial cannot roll
/// back the state of its successor.
struct ConnectContext {
    dial_guard: Mutex<DialGuard>,
    last_connect: AtomicI64,
    reconnect_lvl: AtomicU32,
    generation: AtomicU64,
}

#[derive(Default)]
struct DialGuard {
    token: Option<CancellationToken>,
    generation: u64,
}

impl ConnectContext {
    fn new() -> Self {
        ConnectContext {
            dial_guard: Mutex::new(DialGuard::default()),
            last_connect: AtomicI64::new(i64::MIN / 2),
            reconnect_lvl: AtomicU32::new(0),
            generation: AtomicU64::new(0),
        }
    }

    fn can_connect(&self) -> Result<(), ServiceError> {
        let lvl = self.reconnect_lvl.load(Ordering::Acquire);
        let earliest = self.last_connect.load(Ordering::Acquire) + reconnect_interval_ms(lvl);
        if earliest >= now_millis() {
            return Err(ServiceError::FrequentReconnection);
        }
        Ok(())
    }

    /// Cancels any previous dial, advances the backoff level, and hands
    /// out a fresh token plus its generation.
    fn before_connect(&self) -> (CancellationToken, u64) {
        let mut guard = self.dial_guard.lock().expect("dial guard lock");
        if let Some(old) = guard.token.take() {
            old.cancel();
        }
        self.last_connect.store(now_millis(), Ordering::Release);
        self.reconnect_lvl.fetch_add(1, Ordering::AcqRel);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let token = CancellationToken::new();
        guard.token = Some(token.clone());
        guard.generation = generation;
        (token, generation)
    }

    /// Clears the dial slot.  Returns false when a newer dial already
    /// took over, in which case the caller must not touch shared state.
    fn after_connect(&self, generation: u64, success: bool) -> bool {
        let mut guard = self.dial_guard.lock().expect("dial guard lock");
        if guard.generation != generation {
            return false;
        }
        guard.token = None;
        if success {
            self.reconnect_lvl.store(0, Ordering::Release);
        }
        true
    }

    fn cancel_current(&self) {
        let mut guard = self.dial_guard.lock().expect("dial guard lock");
        if let Some(token) = guard.token.take() {
            token.cancel();
        }
    }
}

impl Remote {
    pub(crate) fn new(
        transfer: Weak<TransferInner>,
        options: Arc<Options>,
        app_info: AppInfo,
        info: InstanceInfo,
    ) -> Self {
        Remote {
            inner: Arc::new(RemoteInner {
                transfer,
                options,
                app_info,
                info: RwLock::new(info),
                state: StateCell::new(ServiceState::Initialized),
                certified: AtomicBool::new(false),
                deadline: AtomicI64::new(i64::MAX),
                conn: RwLock::new(None),
                connect_ctx: ConnectContext::new(),
                resume: Mutex::new(ResumeSets::default()),
            }),
        }
    }

    pub fn state(&self) -> ServiceState {
        self.inner.state.load()
    }

    pub fn is_certified(&self) -> bool {
        self.inner.certified.load(Ordering::Acquire)
    }

    pub fn info(&self) -> InstanceInfo {
        self.inner.info.read().expect("instance info lock").clone()
    }

    fn service_id(&self) -> String {
        self.inner
            .info
            .read()
            .expect("instance info lock")
            .instance_id()
            .to_owned()
    }

    pub fn update_info(&self, new_info: InstanceInfo) -> Result<(), ServiceError> {
        if self.inner.state.load() == ServiceState::Stopped {
            return Err(ServiceError::StoppedInstance);
        }
        let old = {
            let mut info = self.inner.info.write().expect("instance info lock");
            if info.instance_id() != new_info.instance_id()
                || info.ip != new_info.ip
                || info.port != new_info.port
            {
                warn!(
                    old_id = %info.instance_id(),
                    new_id = %new_info.instance_id(),
                    "instance identity changed in update"
                );
                return Err(ServiceError::InvalidParams);
            }
            let old = info.clone();
            *info = new_info.clone();
            old
        };
        if new_info.healthy == old.healthy && new_info.enable == old.enable {
            return Ok(());
        }
        if !new_info.enable {
            self.inner.state.store(ServiceState::Disabled);
            self.inner.deadline.store(
                now_millis() + self.inner.options.transfer_disable_timeout,
                Ordering::Release,
            );
            self.inner.connect_ctx.cancel_current();
            self.close_conn();
            debug!(service_id = %new_info.instance_id(), "instance disabled");
        } else if !new_info.healthy {
            // Still enabled but unhealthy: hold it disabled without a
            // stop deadline until health returns.
            self.inner.state.store(ServiceState::Disabled);
            self.inner.deadline.store(i64::MAX, Ordering::Release);
            self.inner.connect_ctx.cancel_current();
            self.close_conn();
        } else if self.inner.state.load() == ServiceState::Disabled {
            self.inner.state.store(ServiceState::Initialized);
            self.inner.deadline.store(i64::MAX, Ordering::Release);
            if let Err(e) = self.connect() {
                error!(service_id = %new_info.instance_id(), error = %e, "reconnect after enable failed");
            }
        }
        Ok(())
    }

    fn can_state_connect(&self, state: ServiceState) -> Result<(), ServiceError> {
        match state {
            ServiceState::Disabled => Err(ServiceError::DisabledService),
            ServiceState::Stopped => Err(ServiceError::StoppedInstance),
            _ => Ok(()),
        }
    }

    /// Starts a dial on a detached task, subject to state and backoff.
    pub fn connect(&self) -> Result<(), ServiceError> {
        let state = self.inner.state.load();
        self.can_state_connect(state)?;
        if state == ServiceState::Connecting {
            return Err(ServiceError::ConnectingClient);
        }
        self.inner.connect_ctx.can_connect()?;
        if !self.inner.state.compare_swap(state, ServiceState::Connecting) {
            return Err(ServiceError::ConnectingClient);
        }
        let (token, generation) = self.inner.connect_ctx.before_connect();
        let remote = self.clone();
        tokio::spawn(async move {
            remote.dial(token, generation).await;
        });
        Ok(())
    }

    async fn dial(&self, token: CancellationToken, generation: u64) {
        let address = {
            let info = self.inner.info.read().expect("instance info lock");
            info.address()
        };
        debug!(address = %address, "uplink dialing");
        let dial_timeout = self.inner.options.transfer_dial_timeout;
        let attempt = tokio::select! {
            _ = token.cancelled() => None,
            res = tokio::time::timeout(dial_timeout, TcpStream::connect(&address)) => match res {
                Ok(Ok(stream)) => Some(stream),
                Ok(Err(e)) => {
                    error!(address = %address, error = %e, "uplink dial failed");
                    None
                }
                Err(_) => {
                    error!(address = %address, "uplink dial timed out");
                    None
                }
            },
        };
        let success = attempt.is_some();
        if !self.inner.connect_ctx.after_connect(generation, success) {
            // A newer dial superseded this one; its task owns the state.
            return;
        }
        match attempt {
            Some(stream) => {
                self.install_conn(stream);
                if !self
                    .inner
                    .state
                    .compare_swap(ServiceState::Connecting, ServiceState::Connected)
                {
                    // Stopped or disabled while the dial was in flight;
                    // the fresh connection has no home.
                    error!(
                        state = ?self.inner.state.load(),
                        "state moved on during dial, dropping connection"
                    );
                    self.close_conn();
                    return;
                }
                debug!(address = %address, "uplink connected");
                self.handshake();
            }
            None => {
                if !self
                    .inner
                    .state
                    .compare_swap(ServiceState::Connecting, ServiceState::Initialized)
                {
                    debug!(
                        state = ?self.inner.state.load(),
                        "state moved on while dial was failing"
                    );
                }
            }
        }
    }

    fn install_conn(&self, stream: TcpStream) {
        let order = self.inner.options.transfer_byte_order;
        let reader_remote = self.clone();
        let closed_remote = self.clone();
        let mut reassembly = SegmentBuffer::new();
        let conn = spawn_conn(
            stream,
            &self.inner.options,
            order,
            move |body| reader_remote.handle_body(&body, &mut reassembly),
            move || closed_remote.on_conn_closed(),
        );
        let mut slot = self.inner.conn.write().expect("conn slot lock");
        if let Some(old) = slot.replace(conn) {
            old.close();
        }
        self.inner.certified.store(false, Ordering::Release);
    }

    fn on_conn_closed(&self) {
        self.inner.certified.store(false, Ordering::Release);
        debug!(service_id = %self.service_id(), "uplink closed, scheduling reconnect");
        if let Err(e) = self.connect() {
            debug!(service_id = %self.service_id(), error = %e, "immediate reconnect deferred");
        }
    }

    /// Sends the uplink handshake, replaying already-registered conn and
    /// router ids so the peer can resume them.
    fn handshake(&self) {
        if self.is_certified() {
            return;
        }
        let (service, service_id) = {
            let info = self.inner.info.read().expect("instance info lock");
            (info.service().to_owned(), info.instance_id().to_owned())
        };
        let (conn_ids, router_ids) = {
            let resume = self.inner.resume.lock().expect("resume set lock");
            let mut conn_ids: Vec<u64> = resume.conn_ids.iter().copied().collect();
            conn_ids.sort_unstable();
            let mut router_ids: Vec<String> = resume.router_ids.iter().cloned().collect();
            router_ids.sort_unstable();
            (conn_ids, router_ids)
        };
        let req = GatewayMsg::HandshakeReq {
            id: self.inner.app_info.id.clone(),
            auth_key: self.inner.options.transfer_auth_key.clone(),
            service,
            service_id,
            conn_ids,
            router_ids,
        };
        if let Err(e) = self.write_msg(&req) {
            warn!(service_id = %self.service_id(), error = %e, "handshake send failed");
        }
    }

    fn on_handshake_res(&self, code: u16) {
        if code == gate_proto::transfer::code::SUCCESS {
            if self
                .inner
                .certified
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                debug!(service_id = %self.service_id(), "uplink certified");
            }
            return;
        }
        error!(service_id = %self.service_id(), code, "uplink handshake rejected");
        // Unrecoverable by retrying the same frame; drop the connection
        // and let keepalive reconnect under backoff.
        self.close_conn();
    }

    /// One keepalive tick.  Returns false when the instance reached
    /// Stopped and should be removed.
    pub fn keep_alive(&self) -> bool {
        match self.inner.state.load() {
            ServiceState::Disabled => {
                if now_millis() > self.inner.deadline.load(Ordering::Acquire) {
                    if self
                        .inner
                        .state
                        .compare_swap(ServiceState::Disabled, ServiceState::Stopped)
                    {
                        debug!(service_id = %self.service_id(), "disable deadline expired, stopping");
                        return false;
                    }
                }
                true
            }
            ServiceState::Stopped => false,
            _ => {
                let closed = {
                    let conn = self.inner.conn.read().expect("conn slot lock");
                    conn.as_ref().map_or(true, Conn::is_closed)
                };
                if closed {
                    if let Err(e) = self.connect() {
                        debug!(service_id = %self.service_id(), error = %e, "keepalive reconnect deferred");
                    }
                } else if !self.is_certified() {
                    self.handshake();
                } else if let Err(e) = self.write_msg(&GatewayMsg::HeartbeatSReq {
                    conn_id: 0,
                    payload: Vec::new(),
                }) {
                    warn!(service_id = %self.service_id(), error = %e, "uplink heartbeat failed");
                }
                true
            }
        }
    }

    fn check_alive(&self) -> Result<(), ServiceError> {
        match self.inner.state.load() {
            ServiceState::Initialized => return Err(ServiceError::NotConnected),
            ServiceState::Connecting => return Err(ServiceError::ConnectingClient),
            ServiceState::Disabled => return Err(ServiceError::DisabledService),
            ServiceState::Stopped => return Err(ServiceError::StoppedInstance),
            ServiceState::Connected => {}
        }
        let closed = {
            let conn = self.inner.conn.read().expect("conn slot lock");
            conn.as_ref().map_or(true, Conn::is_closed)
        };
        if closed {
            self.connect()?;
            return Err(ServiceError::ConnectingClient);
        }
        if !self.is_certified() {
            return Err(ServiceError::NoCertification);
        }
        Ok(())
    }

    pub fn send_message(&self, msg: &GatewayMsg) -> Result<(), ServiceError> {
        self.check_alive()?;
        self.write_msg(msg)
    }

    pub fn transfer_message(&self, payload: &[u8]) -> Result<(), ServiceError> {
        self.check_alive()?;
        self.write_raw(Bytes::copy_from_slice(payload))
    }

    fn write_msg(&self, msg: &GatewayMsg) -> Result<(), ServiceError> {
        let order = self.inner.options.transfer_byte_order;
        let body = msg.encode_body(order)?;
        if body.len() > self.inner.options.transfer_message_warning_size {
            warn!(
                service_id = %self.service_id(),
                size = body.len(),
                "large uplink message"
            );
        }
        let frames = gate_proto::transfer::frames_from_body(body, order)?;
        self.write_raw(frames)
    }

    fn write_raw(&self, frames: Bytes) -> Result<(), ServiceError> {
        let conn = self.inner.conn.read().expect("conn slot lock");
        match conn.as_ref() {
            Some(conn) => conn.send(frames),
            None => Err(ServiceError::NotConnected),
        }
    }

    fn close_conn(&self) {
        let conn = self.inner.conn.read().expect("conn slot lock");
        if let Some(conn) = conn.as_ref() {
            conn.close();
        }
    }

    pub fn is_enable(&self) -> bool {
        !matches!(
            self.inner.state.load(),
            ServiceState::Disabled | ServiceState::Stopped
        )
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.state.load() == ServiceState::Stopped
    }

    pub fn stop(&self) -> Result<(), ServiceError> {
        if self.inner.state.load() == ServiceState::Stopped {
            return Err(ServiceError::StoppedInstance);
        }
        self.inner.state.store(ServiceState::Stopped);
        self.inner.connect_ctx.cancel_current();
        self.close_conn();
        Ok(())
    }

    /// Decodes one frame body off the uplink and reacts to it.  Protocol
    /// errors are logged and the frame dropped; the connection stays up.
    fn handle_body(&self, body: &[u8], reassembly: &mut SegmentBuffer) {
        let order = self.inner.options.transfer_byte_order;
        match BackendMsg::decode(body, order) {
            Ok(msg) => self.handle_msg(msg, reassembly),
            Err(e) => {
                warn!(service_id = %self.service_id(), error = %e, "undecodable uplink frame dropped");
            }
        }
    }

    fn handle_msg(&self, msg: BackendMsg, reassembly: &mut SegmentBuffer) {
        match msg {
            BackendMsg::HandshakeRes { code } => self.on_handshake_res(code),
            BackendMsg::Segment { amount, seq, frame } => {
                match reassembly.push(amount, seq, &frame) {
                    SegmentPush::Complete(body) => self.handle_body(&body, &mut SegmentBuffer::new()),
                    SegmentPush::Pending => {}
                    SegmentPush::Dropped(reason) => {
                        warn!(service_id = %self.service_id(), ?reason, "segment run dropped");
                    }
                }
            }
            BackendMsg::ServiceInstIReq { service } => self.reply_instance_list(&service),
            BackendMsg::RegisterSRes {
                conn_id,
                code,
                ref router_id,
                ..
            } => {
                if code == gate_proto::transfer::code::SUCCESS {
                    let mut resume = self.inner.resume.lock().expect("resume set lock");
                    resume.conn_ids.insert(conn_id);
                    if !router_id.is_empty() {
                        resume.router_ids.insert(router_id.clone());
                    }
                }
                self.dispatch(msg);
            }
            BackendMsg::UnregisterSRes { conn_id } => {
                self.inner
                    .resume
                    .lock()
                    .expect("resume set lock")
                    .conn_ids
                    .remove(&conn_id);
                self.dispatch(msg);
            }
            other => self.dispatch(other),
        }
    }

    fn dispatch(&self, msg: BackendMsg) {
        let Some(transfer) = self.inner.transfer.upgrade() else {
            return;
        };
        dispatch::dispatch_backend_msg(&transfer, msg);
    }

    fn reply_instance_list(&self, service: &str) {
        let Some(transfer) = self.inner.transfer.upgrade() else {
            return;
        };
        let instance_ids = transfer
            .manager(service)
            .map(|m| m.instance_ids())
            .unwrap_or_default();
        let res = GatewayMsg::ServiceInstIRes {
            service: service.to_owned(),
            instance_ids,
        };
        if let Err(e) = self.write_msg(&res) {
            warn!(service = %service, error = %e, "instance list reply failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_table_cycles_by_level() {
        assert_eq!(reconnect_interval_ms(0), 2_000);
        assert_eq!(reconnect_interval_ms(1), 2_000);
        assert_eq!(reconnect_interval_ms(2), 4_000);
        assert_eq!(reconnect_interval_ms(3), 8_000);
        assert_eq!(reconnect_interval_ms(4), 10_000);
        assert_eq!(reconnect_interval_ms(5), 2_000);
        assert_eq!(reconnect_interval_ms(7), 8_000);
    }

    #[test]
    fn can_connect_honours_backoff_window() {
        let ctx = ConnectContext::new();
        // Never connected: allowed immediately.
        assert!(ctx.can_connect().is_ok());

        // Fresh attempt at level 1 (2 s window): an immediate retry is
        // too frequent, a retry 3 s in the past is fine.
        ctx.before_connect();
        assert_eq!(
            ctx.can_connect(),
            Err(ServiceError::FrequentReconnection)
        );
        ctx.last_connect.store(now_millis() - 3_000, Ordering::Release);
        assert!(ctx.can_connect().is_ok());

        // Level 3 widens the window to 8 s.
        ctx.before_connect();
        ctx.before_connect();
        assert_eq!(ctx.reconnect_lvl.load(Ordering::Acquire), 3);
        ctx.last_connect.store(now_millis() - 5_000, Ordering::Release);
        assert_eq!(
            ctx.can_connect(),
            Err(ServiceError::FrequentReconnection)
        );
        ctx.last_connect.store(now_millis() - 8_100, Ordering::Release);
        assert!(ctx.can_connect().is_ok());
    }

    #[test]
    fn success_resets_backoff_level() {
        let ctx = ConnectContext::new();
        let (_, gen1) = ctx.before_connect();
        assert!(ctx.after_connect(gen1, true));
        assert_eq!(ctx.reconnect_lvl.load(Ordering::Acquire), 0);
    }

    #[test]
    fn superseded_dial_cannot_finish() {
        let ctx = ConnectContext::new();
        let (token1, gen1) = ctx.before_connect();
        let (_token2, gen2) = ctx.before_connect();
        assert!(token1.is_cancelled());
        assert!(!ctx.after_connect(gen1, false));
        assert!(ctx.after_connect(gen2, true));
    }
}
