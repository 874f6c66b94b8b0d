//! Backend→user dispatch.
//!
//! Every message a backend instance sends toward users funnels through
//! here, whether it arrived on an uplink or from an in-process handler.
//! Each delivery re-enters the sharded executor under the target conn
//! id, so per-connection ordering is preserved; only routing envelopes
//! leave that lane (they run on a detached task and are explicitly
//! unordered).

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::{debug, error, warn};

use gate_proto::transfer::{BackendMsg, code};
use gate_proto::user::{self, ServerMsg};

use crate::executor::ShardLocal;
use crate::session::UserSession;
use crate::transfer::TransferInner;

fn session_from_local<'a>(local: &'a ShardLocal, conn_id: u64) -> Option<&'a UserSession> {
    let sess = local.get(conn_id);
    if sess.is_none() {
        debug!(conn_id, "lost connection");
    }
    sess
}

pub(crate) fn dispatch_backend_msg(transfer: &Arc<TransferInner>, msg: BackendMsg) {
    match msg {
        BackendMsg::MessageSRes { conn_id, payload } => {
            transfer.forward(conn_id, move |local| {
                if let Some(sess) = session_from_local(local, conn_id) {
                    sess.send_message(ServerMsg::MessageRes {
                        code: user::code::SUCCESS,
                        payload,
                    });
                }
            });
        }
        BackendMsg::RegisterSRes {
            conn_id,
            code: res_code,
            payload,
            ..
        } => {
            transfer.forward(conn_id, move |local| {
                let Some(sess) = session_from_local(local, conn_id) else {
                    return;
                };
                if res_code == code::SUCCESS {
                    sess.ctx().set_registered();
                }
                // The payload is the backend's login result either way;
                // the user learns the outcome from it.
                sess.send_message(ServerMsg::MessageRes {
                    code: user::code::SUCCESS,
                    payload,
                });
            });
        }
        BackendMsg::UnregisterSRes { conn_id } => {
            transfer.forward(conn_id, move |local| {
                if let Some(sess) = local.remove(conn_id) {
                    sess.close();
                }
            });
        }
        BackendMsg::HeartbeatSRes { conn_id, payload } => {
            // conn id zero is the uplink's own keepalive reply.
            if conn_id == 0 {
                return;
            }
            transfer.forward(conn_id, move |local| {
                if let Some(sess) = session_from_local(local, conn_id) {
                    sess.send_message(ServerMsg::HeartbeatRes {
                        code: user::code::SUCCESS,
                        payload,
                    });
                }
            });
        }
        BackendMsg::BroadcastSRes { conn_ids, payload } => {
            for conn_id in conn_ids {
                let payload = payload.clone();
                transfer.forward(conn_id, move |local| {
                    if let Some(sess) = session_from_local(local, conn_id) {
                        sess.send_message(ServerMsg::MessageRes {
                            code: user::code::SUCCESS,
                            payload,
                        });
                    }
                });
            }
        }
        BackendMsg::MessageRouter {
            router_service,
            router_type,
            router_id,
            payload,
        } => {
            // Routing is unordered relative to session traffic; run it
            // off the shard lanes.
            let transfer = transfer.clone();
            tokio::spawn(async move {
                let Some(manager) = transfer.manager(&router_service) else {
                    warn!(router_service = %router_service, "router envelope for unknown service");
                    return;
                };
                let result = catch_unwind(AssertUnwindSafe(|| {
                    manager.route(router_type, &router_id, &payload);
                }));
                if result.is_err() {
                    error!(router_service = %router_service, router_id = %router_id, "router panicked");
                }
            });
        }
        other => {
            debug!(msg = ?message_kind(&other), "message ignored on dispatch path");
        }
    }
}

fn message_kind(msg: &BackendMsg) -> &'static str {
    match msg {
        BackendMsg::HandshakeRes { .. } => "HandshakeRes",
        BackendMsg::RegisterSRes { .. } => "RegisterSRes",
        BackendMsg::UnregisterSRes { .. } => "UnregisterSRes",
        BackendMsg::HeartbeatSRes { .. } => "HeartbeatSRes",
        BackendMsg::MessageSRes { .. } => "MessageSRes",
        BackendMsg::BroadcastSRes { .. } => "BroadcastSRes",
        BackendMsg::MessageRouter { .. } => "MessageRouter",
        BackendMsg::ServiceInstIReq { .. } => "ServiceInstIReq",
        BackendMsg::Segment { .. } => "Segment",
    }
}
