//! User message handling.
//!
//! Every user frame is forwarded to the session's shard before any
//! state is touched, which keeps per-connection handling strictly in
//! arrival order.  Handshake selection is the one exception: picking an
//! instance may block on the sticky cache, so it runs on the blocking
//! pool and re-publishes the binding through the context's lock.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use gate_proto::transfer::GatewayMsg;
use gate_proto::user::{ClientMsg, ServerMsg, code};

use crate::session::UserSession;
use crate::transfer::TransferInner;

pub(crate) fn on_session_opened(transfer: &Arc<TransferInner>, session: UserSession) {
    let conn_id = session.conn_id();
    debug!(conn_id, "user session opened");
    transfer.forward(conn_id, move |local| {
        local.set(conn_id, session);
    });
}

pub(crate) fn on_session_closed(transfer: &Arc<TransferInner>, conn_id: u64) {
    info!(conn_id, "user session closed");
    transfer.forward(conn_id, move |local| {
        local.remove(conn_id);
    });
}

pub(crate) fn handle_client_msg(
    transfer: &Arc<TransferInner>,
    session: &UserSession,
    msg: ClientMsg,
) {
    match msg {
        ClientMsg::HandshakeReq {
            router_id,
            auth_key,
            service,
        } => handle_handshake(transfer, session, router_id, auth_key, service),
        ClientMsg::HeartbeatReq { payload } => handle_heartbeat(transfer, session, payload),
        ClientMsg::MessageReq { service, payload } => {
            handle_message(transfer, session, service, payload);
        }
    }
}

fn handle_handshake(
    transfer: &Arc<TransferInner>,
    session: &UserSession,
    router_id: String,
    auth_key: String,
    service: String,
) {
    let conn_id = session.conn_id();
    let session_for_closure = session.clone();
    let session = session.clone();
    let t = transfer.clone();
    let submitted = transfer.try_forward(conn_id, move |_| {
        let session = session_for_closure;
        if auth_key != t.options.receiver_auth_key {
            session.send_message(ServerMsg::HandshakeRes {
                code: code::INVALID_AUTH_KEY,
            });
            return;
        }
        if session.ctx().service(&service).is_some() {
            // Re-handshake for a service already bound: idempotent.
            session.send_message(ServerMsg::HandshakeRes {
                code: code::SUCCESS,
            });
            return;
        }
        let Some(manager) = t.manager(&service) else {
            session.send_message(ServerMsg::HandshakeRes {
                code: code::UNKNOWN_SERVICE,
            });
            return;
        };
        // Selection may hit the sticky cache; keep it off the shard.
        tokio::task::spawn_blocking(move || match manager.select_instance(&router_id) {
            Err(e) => {
                error!(conn_id, router_id = %router_id, error = %e, "instance selection failed");
                session.send_message(ServerMsg::HandshakeRes {
                    code: code::SELECT_ERROR,
                });
            }
            Ok(None) => {
                session.send_message(ServerMsg::HandshakeRes {
                    code: code::LESS_INSTANCE,
                });
            }
            Ok(Some(srv)) => {
                debug!(conn_id, service = %service, router_id = %router_id, "session bound to instance");
                session.ctx().set_service(&service, srv);
                session.send_message(ServerMsg::HandshakeRes {
                    code: code::SUCCESS,
                });
            }
        });
    });
    if submitted.is_err() {
        session.send_message(ServerMsg::HandshakeRes {
            code: code::INNER_ERROR,
        });
    }
}

fn handle_message(
    transfer: &Arc<TransferInner>,
    session: &UserSession,
    service: String,
    payload: Vec<u8>,
) {
    let conn_id = session.conn_id();
    let session_for_closure = session.clone();
    let session = session.clone();
    let submitted = transfer.try_forward(conn_id, move |_| {
        let session = session_for_closure;
        let ctx = session.ctx();
        let resolved = if service.is_empty() {
            ctx.default_service().map(|(name, _)| name).unwrap_or_default()
        } else {
            service
        };
        let Some(srv) = ctx.service(&resolved) else {
            session.send_message(ServerMsg::MessageRes {
                code: code::HANDSHAKE_FIRST,
                payload: Vec::new(),
            });
            return;
        };
        if srv.is_stopped() {
            // The bound instance is gone for good; the session has to
            // start over.
            session.close();
            return;
        }
        let result = if ctx.is_registered() {
            debug!(conn_id, service = %resolved, "forwarding message");
            srv.send_message(GatewayMsg::MessageSReq { conn_id, payload })
        } else {
            // First application message doubles as the login.
            debug!(conn_id, service = %resolved, "registering session");
            srv.send_message(GatewayMsg::RegisterSReq { conn_id, payload })
        };
        if let Err(e) = result {
            error!(conn_id, service = %resolved, error = %e, "uplink send failed");
        }
    });
    if submitted.is_err() {
        session.send_message(ServerMsg::MessageRes {
            code: code::INNER_ERROR,
            payload: Vec::new(),
        });
    }
}

fn handle_heartbeat(transfer: &Arc<TransferInner>, session: &UserSession, payload: Vec<u8>) {
    let conn_id = session.conn_id();
    let session = session.clone();
    let submitted = transfer.try_forward(conn_id, move |_| {
        let ctx = session.ctx();
        if !ctx.is_registered() {
            session.send_message(ServerMsg::HeartbeatRes {
                code: code::LOGIN_FIRST,
                payload: Vec::new(),
            });
            return;
        }
        let Some((_, srv)) = ctx.default_service() else {
            session.send_message(ServerMsg::HeartbeatRes {
                code: code::HANDSHAKE_FIRST,
                payload: Vec::new(),
            });
            return;
        };
        if srv.is_stopped() {
            session.close();
            return;
        }
        ctx.update_deadline();
        if let Err(e) = srv.send_message(GatewayMsg::HeartbeatSReq { conn_id, payload }) {
            error!(conn_id, error = %e, "heartbeat forward failed");
        }
    });
    if submitted.is_err() {
        warn!(conn_id, "heartbeat dropped, executor queue full");
    }
}
