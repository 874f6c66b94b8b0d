//! Local backend instance: the gateway itself serves the service.
//!
//! Chosen when a discovered instance id equals this gateway's own app
//! id.  Messages short-circuit to the embedder's handler; replies the
//! handler sends come back through a fabricated session that feeds the
//! normal backend→user dispatch path.  There is no handshake and no
//! network keepalive.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use tracing::error;

use gate_proto::segment::{SegmentBuffer, SegmentPush};
use gate_proto::transfer::{BackendMsg, GatewayMsg};
use gate_proto::{ByteOrder, CodecError};

use crate::dispatch;
use crate::error::ServiceError;
use crate::handler::{BackendSession, MessageHandler};
use crate::options::Options;
use crate::registry::InstanceInfo;
use crate::transfer::TransferInner;

pub struct Local {
    info: RwLock<InstanceInfo>,
    handler: Arc<dyn MessageHandler>,
    session: LocalSession,
    order: ByteOrder,
    stopped: AtomicBool,
}

/// The session a local handler replies through; its sends re-enter the
/// gateway as if they had arrived on an uplink.
struct LocalSession {
    transfer: Weak<TransferInner>,
}

impl BackendSession for LocalSession {
    fn send_message(&self, msg: BackendMsg) {
        if let Some(transfer) = self.transfer.upgrade() {
            dispatch::dispatch_backend_msg(&transfer, msg);
        }
    }
}

impl Local {
    pub(crate) fn new(
        transfer: Weak<TransferInner>,
        options: &Arc<Options>,
        info: InstanceInfo,
    ) -> Result<Self, ServiceError> {
        let handler = options
            .service_message_handler
            .get(info.service())
            .cloned()
            .ok_or_else(|| {
                error!(service = %info.service(), "no local handler for in-process instance");
                ServiceError::InvalidParams
            })?;
        Ok(Local {
            info: RwLock::new(info),
            handler,
            session: LocalSession { transfer },
            order: options.transfer_byte_order,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn info(&self) -> InstanceInfo {
        self.info.read().expect("instance info lock").clone()
    }

    pub fn update_info(&self, new_info: InstanceInfo) -> Result<(), ServiceError> {
        let mut info = self.info.write().expect("instance info lock");
        if info.service_name != new_info.service_name
            || info.instance_id() != new_info.instance_id()
        {
            return Err(ServiceError::InvalidParams);
        }
        *info = new_info;
        Ok(())
    }

    pub fn keep_alive(&self) -> bool {
        !self.stopped.load(Ordering::Acquire)
    }

    pub fn send_message(&self, msg: GatewayMsg) -> Result<(), ServiceError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(ServiceError::StoppedInstance);
        }
        if !self.info.read().expect("instance info lock").enable {
            return Err(ServiceError::DisabledService);
        }
        // Handler panics must not take the shard worker down with them.
        match catch_unwind(AssertUnwindSafe(|| {
            self.handler.handle_message(&self.session, msg)
        })) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ServiceError::Handler(e.to_string())),
            Err(_) => {
                error!(
                    service = %self.info.read().expect("instance info lock").service(),
                    "local handler panicked"
                );
                Ok(())
            }
        }
    }

    /// Decodes routed raw frames and feeds them to the handler, so
    /// router fan-out reaches in-process instances too.
    pub fn transfer_message(&self, payload: &[u8]) -> Result<(), ServiceError> {
        let mut reassembly = SegmentBuffer::new();
        for body in iter_frames(payload, self.order) {
            let body = body?;
            match GatewayMsg::decode(&body, self.order)? {
                GatewayMsg::Segment { amount, seq, frame } => {
                    match reassembly.push(amount, seq, &frame) {
                        SegmentPush::Complete(full) => {
                            let msg = GatewayMsg::decode(&full, self.order)?;
                            self.send_message(msg)?;
                        }
                        SegmentPush::Pending => {}
                        SegmentPush::Dropped(reason) => {
                            error!(?reason, "routed segment run dropped");
                        }
                    }
                }
                msg => self.send_message(msg)?,
            }
        }
        Ok(())
    }

    pub fn is_enable(&self) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            return false;
        }
        self.info.read().expect("instance info lock").enable
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn stop(&self) -> Result<(), ServiceError> {
        self.stopped.store(true, Ordering::Release);
        Ok(())
    }
}

/// Walks a run of length-prefixed frames.
fn iter_frames(
    mut buf: &[u8],
    order: ByteOrder,
) -> impl Iterator<Item = Result<Vec<u8>, CodecError>> + '_ {
    std::iter::from_fn(move || {
        if buf.is_empty() {
            return None;
        }
        if buf.len() < 2 {
            buf = &[];
            return Some(Err(CodecError::Truncated));
        }
        let len = match order {
            ByteOrder::Big => u16::from_be_bytes([buf[0], buf[1]]),
            ByteOrder::Little => u16::from_le_bytes([buf[0], buf[1]]),
        } as usize;
        if buf.len() < 2 + len {
            buf = &[];
            return Some(Err(CodecError::Truncated));
        }
        let body = buf[2..2 + len].to_vec();
        buf = &buf[2 + len..];
        Some(Ok(body))
    })
}
