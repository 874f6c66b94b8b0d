//! User-facing receiver: terminates end-user connections.
//!
//! One listener per gateway, `tcp://` or `ws://`.  Each accepted
//! connection gets a conn id, a [`SenderContext`], a bounded outbound
//! queue with its own writer task, and a reader loop that decodes user
//! frames and hands them to the listener logic.  All session state is
//! registered into the sharded executor on open and removed on close.

pub(crate) mod listener;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gate_proto::framing::FrameCodec;
use gate_proto::user::ClientMsg;

use crate::error::GatewayError;
use crate::session::{SenderContext, UserSession};
use crate::transfer::{Transfer, TransferInner};

/// Outbound queue depth per user session.
const USER_WRITE_QUEUE_CAP: usize = 128;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Proto {
    Tcp,
    Ws,
}

fn parse_proto_addr(proto_addr: &str) -> Result<(Proto, String), GatewayError> {
    let Some((proto, addr)) = proto_addr.split_once("://") else {
        return Err(GatewayError::InvalidListenAddr(proto_addr.to_owned()));
    };
    let proto = match proto {
        "tcp" => Proto::Tcp,
        "ws" => Proto::Ws,
        other => return Err(GatewayError::UnsupportedProto(other.to_owned())),
    };
    if addr.is_empty() {
        return Err(GatewayError::InvalidListenAddr(proto_addr.to_owned()));
    }
    Ok((proto, addr.to_owned()))
}

pub struct Receiver {
    transfer: Arc<TransferInner>,
    cancel: CancellationToken,
    local_addr: OnceLock<SocketAddr>,
}

impl Receiver {
    pub fn new(transfer: &Transfer) -> Self {
        Receiver {
            transfer: transfer.inner.clone(),
            cancel: CancellationToken::new(),
            local_addr: OnceLock::new(),
        }
    }

    /// Binds the listen address and starts accepting sessions.
    pub async fn start(&self) -> Result<(), GatewayError> {
        let proto_addr = self.transfer.options.receiver_proto_addr.clone();
        let (proto, addr) = parse_proto_addr(&proto_addr)?;
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| GatewayError::Bind {
                addr: addr.clone(),
                source,
            })?;
        if let Ok(local) = listener.local_addr() {
            let _ = self.local_addr.set(local);
        }
        info!(addr = %addr, ?proto, "receiver listening");

        let transfer = self.transfer.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(peer = %peer, "user connection accepted");
                            let transfer = transfer.clone();
                            let session_cancel = cancel.child_token();
                            tokio::spawn(async move {
                                match proto {
                                    Proto::Tcp => {
                                        serve_tcp_session(transfer, stream, session_cancel).await;
                                    }
                                    Proto::Ws => {
                                        serve_ws_session(transfer, stream, session_cancel).await;
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                        }
                    },
                }
            }
        });
        Ok(())
    }

    /// The bound address, once started.  Useful when binding port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
    }
}

fn new_session(
    transfer: &Arc<TransferInner>,
    cancel: CancellationToken,
) -> (UserSession, mpsc::Receiver<gate_proto::user::ServerMsg>) {
    let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::AcqRel);
    let (out_tx, out_rx) = mpsc::channel(USER_WRITE_QUEUE_CAP);
    let options = &transfer.options;
    let ctx = SenderContext::new(
        options.unregistered_sender_expiration,
        options.registered_sender_expiration,
    );
    let session = UserSession::new(conn_id, out_tx, cancel, ctx);
    (session, out_rx)
}

async fn serve_tcp_session(
    transfer: Arc<TransferInner>,
    stream: TcpStream,
    cancel: CancellationToken,
) {
    let order = transfer.options.receiver_byte_order;
    let (session, mut out_rx) = new_session(&transfer, cancel.clone());
    let conn_id = session.conn_id();
    listener::on_session_opened(&transfer, session.clone());

    let (read_half, mut write_half) = stream.into_split();

    let writer_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => break,
                item = out_rx.recv() => match item {
                    Some(msg) => match msg.encode_frame(order) {
                        Ok(frame) => {
                            if write_half.write_all(&frame).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(conn_id, error = %e, "outbound user message dropped"),
                    },
                    None => break,
                },
            }
        }
        let _ = write_half.shutdown().await;
    });

    let mut framed = FramedRead::new(read_half, FrameCodec::new(order));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = framed.next() => match frame {
                Some(Ok(body)) => match ClientMsg::decode(&body, order) {
                    Ok(msg) => listener::handle_client_msg(&transfer, &session, msg),
                    // Malformed frames are dropped; the framing layer is
                    // still aligned, so the connection survives.
                    Err(e) => warn!(conn_id, error = %e, "undecodable user frame dropped"),
                },
                Some(Err(e)) => {
                    warn!(conn_id, error = %e, "user read failed");
                    break;
                }
                None => break,
            },
        }
    }
    session.mark_closed();
    cancel.cancel();
    listener::on_session_closed(&transfer, conn_id);
}

async fn serve_ws_session(
    transfer: Arc<TransferInner>,
    stream: TcpStream,
    cancel: CancellationToken,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(error = %e, "websocket upgrade failed");
            return;
        }
    };
    let order = transfer.options.receiver_byte_order;
    let (session, mut out_rx) = new_session(&transfer, cancel.clone());
    let conn_id = session.conn_id();
    listener::on_session_opened(&transfer, session.clone());

    let (mut sink, mut ws_stream) = ws.split();

    let writer_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => break,
                item = out_rx.recv() => match item {
                    // One body per binary message; the websocket layer
                    // provides the framing.
                    Some(msg) => match msg.encode_body(order) {
                        Ok(body) => {
                            if sink.send(Message::Binary(body.into())).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(conn_id, error = %e, "outbound user message dropped"),
                    },
                    None => break,
                },
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = ws_stream.next() => match frame {
                Some(Ok(Message::Binary(body))) => match ClientMsg::decode(&body, order) {
                    Ok(msg) => listener::handle_client_msg(&transfer, &session, msg),
                    Err(e) => warn!(conn_id, error = %e, "undecodable user frame dropped"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(conn_id, error = %e, "websocket read failed");
                    break;
                }
            },
        }
    }
    session.mark_closed();
    cancel.cancel();
    listener::on_session_closed(&transfer, conn_id);
}
