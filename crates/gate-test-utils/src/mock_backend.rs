//! Mock backend instance.
//!
//! A TCP server speaking the backend dialect: validates the gateway's
//! uplink handshake, registers users from login payloads, and echoes
//! application traffic.  Echo requests with magic prefixes trigger the
//! server-initiated flows tests need:
//!
//! - `broadcast:<text>`: one `BroadcastSRes` to every registered conn,
//! - `big:<n>`: an echo response padded to `n` bytes, exercising
//!   segmentation on the way back to the gateway.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use gate_proto::ByteOrder;
use gate_proto::framing::FrameCodec;
use gate_proto::segment::{SegmentBuffer, SegmentPush};
use gate_proto::transfer::{BackendMsg, GatewayMsg, code};

use crate::app_msg::AppMsg;

#[derive(Debug, Clone)]
pub struct MockBackendConfig {
    pub service: String,
    pub service_id: String,
    pub auth_key: String,
    pub order: ByteOrder,
}

impl MockBackendConfig {
    pub fn new(service: &str, service_id: &str, auth_key: &str) -> Self {
        MockBackendConfig {
            service: service.to_owned(),
            service_id: service_id.to_owned(),
            auth_key: auth_key.to_owned(),
            order: ByteOrder::Big,
        }
    }
}

/// Sender half of one accepted uplink.
#[derive(Clone)]
pub struct UplinkHandle {
    tx: mpsc::UnboundedSender<BackendMsg>,
}

impl UplinkHandle {
    pub fn send(&self, msg: BackendMsg) {
        let _ = self.tx.send(msg);
    }
}

#[derive(Default)]
struct Shared {
    handshakes: Vec<GatewayMsg>,
    registered: HashSet<u64>,
    uplinks: Vec<UplinkHandle>,
    rpc_reqs: Vec<GatewayMsg>,
    instance_lists: Vec<GatewayMsg>,
}

pub struct MockBackend {
    config: MockBackendConfig,
    addr: SocketAddr,
    cancel: CancellationToken,
    shared: Arc<Mutex<Shared>>,
}

impl MockBackend {
    /// Binds an ephemeral loopback port and starts serving uplinks.
    pub async fn start(config: MockBackendConfig) -> std::io::Result<Self> {
        Self::start_on("127.0.0.1:0", config).await
    }

    /// Binds a specific address; used to stand a backend back up on the
    /// port a previous incarnation held.
    pub async fn start_on(addr: &str, config: MockBackendConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let shared = Arc::new(Mutex::new(Shared::default()));

        let accept_cancel = cancel.clone();
        let accept_shared = shared.clone();
        let accept_config = config.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(peer = %peer, "mock backend uplink accepted");
                            tokio::spawn(serve_uplink(
                                stream,
                                accept_config.clone(),
                                accept_shared.clone(),
                                accept_cancel.child_token(),
                            ));
                        }
                        Err(_) => break,
                    },
                }
            }
        });

        Ok(MockBackend {
            config,
            addr,
            cancel,
            shared,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn service_id(&self) -> &str {
        &self.config.service_id
    }

    /// Handshake requests seen so far, newest last.
    pub fn handshakes(&self) -> Vec<GatewayMsg> {
        self.shared.lock().expect("mock state lock").handshakes.clone()
    }

    pub fn registered_conns(&self) -> HashSet<u64> {
        self.shared.lock().expect("mock state lock").registered.clone()
    }

    /// RPC requests routed to this instance.
    pub fn rpc_reqs(&self) -> Vec<GatewayMsg> {
        self.shared.lock().expect("mock state lock").rpc_reqs.clone()
    }

    /// Instance-list answers the gateway sent back.
    pub fn instance_lists(&self) -> Vec<GatewayMsg> {
        self.shared
            .lock()
            .expect("mock state lock")
            .instance_lists
            .clone()
    }

    /// The most recently accepted uplink, for server-initiated sends.
    pub fn latest_uplink(&self) -> Option<UplinkHandle> {
        self.shared
            .lock()
            .expect("mock state lock")
            .uplinks
            .last()
            .cloned()
    }

    /// Stops accepting and tears down live uplinks.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

async fn serve_uplink(
    stream: TcpStream,
    config: MockBackendConfig,
    shared: Arc<Mutex<Shared>>,
    cancel: CancellationToken,
) {
    let order = config.order;
    let (read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<BackendMsg>();
    shared
        .lock()
        .expect("mock state lock")
        .uplinks
        .push(UplinkHandle { tx: tx.clone() });

    let writer_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => break,
                item = rx.recv() => match item {
                    Some(msg) => match msg.encode_frames(order) {
                        Ok(frames) => {
                            if write_half.write_all(&frames).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "mock backend encode failed"),
                    },
                    None => break,
                },
            }
        }
        let _ = write_half.shutdown().await;
    });

    let mut framed = FramedRead::new(read_half, FrameCodec::new(order));
    let mut handshaken = false;
    let mut reassembly = SegmentBuffer::new();
    loop {
        let body = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = framed.next() => match frame {
                Some(Ok(body)) => body,
                _ => break,
            },
        };
        let msg = match GatewayMsg::decode(&body, order) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "mock backend undecodable frame");
                continue;
            }
        };
        let msg = match msg {
            GatewayMsg::Segment { amount, seq, frame } => {
                match reassembly.push(amount, seq, &frame) {
                    SegmentPush::Complete(full) => match GatewayMsg::decode(&full, order) {
                        Ok(m) => m,
                        Err(e) => {
                            warn!(error = %e, "mock backend undecodable reassembled frame");
                            continue;
                        }
                    },
                    _ => continue,
                }
            }
            other => other,
        };
        handle_msg(msg, &config, &shared, &tx, &mut handshaken);
    }
    cancel.cancel();
}

fn handle_msg(
    msg: GatewayMsg,
    config: &MockBackendConfig,
    shared: &Arc<Mutex<Shared>>,
    tx: &mpsc::UnboundedSender<BackendMsg>,
    handshaken: &mut bool,
) {
    match msg {
        GatewayMsg::HandshakeReq {
            ref id,
            ref auth_key,
            ref service,
            ref service_id,
            ..
        } => {
            let res_code = if id.is_empty() {
                code::INVALID_TRANSFER_ID
            } else if auth_key != &config.auth_key {
                code::INVALID_AUTH
            } else if service != &config.service {
                code::INVALID_SERVICE
            } else if service_id != &config.service_id {
                code::INVALID_SERVICE_ID
            } else {
                code::SUCCESS
            };
            *handshaken = res_code == code::SUCCESS;
            shared
                .lock()
                .expect("mock state lock")
                .handshakes
                .push(msg.clone());
            let _ = tx.send(BackendMsg::HandshakeRes { code: res_code });
        }
        GatewayMsg::RegisterSReq { conn_id, payload } => {
            if !*handshaken {
                return;
            }
            match AppMsg::decode(&payload) {
                Ok(AppMsg::LoginReq { req_id, uid }) => {
                    shared
                        .lock()
                        .expect("mock state lock")
                        .registered
                        .insert(conn_id);
                    let _ = tx.send(BackendMsg::RegisterSRes {
                        conn_id,
                        code: code::SUCCESS,
                        router_id: format!("u-{uid}"),
                        payload: AppMsg::LoginResp {
                            req_id,
                            msg: "ok".into(),
                        }
                        .encode(),
                    });
                }
                _ => {
                    let _ = tx.send(BackendMsg::RegisterSRes {
                        conn_id,
                        code: code::AUTH_FAILED,
                        router_id: String::new(),
                        payload: AppMsg::ErrorResp {
                            msg: "login first".into(),
                        }
                        .encode(),
                    });
                }
            }
        }
        GatewayMsg::UnregisterSReq { conn_id } => {
            shared
                .lock()
                .expect("mock state lock")
                .registered
                .remove(&conn_id);
            let _ = tx.send(BackendMsg::UnregisterSRes { conn_id });
        }
        GatewayMsg::HeartbeatSReq { conn_id, payload } => {
            if !*handshaken {
                return;
            }
            let _ = tx.send(BackendMsg::HeartbeatSRes { conn_id, payload });
        }
        GatewayMsg::MessageSReq { conn_id, payload } => {
            if !*handshaken {
                return;
            }
            let registered = shared
                .lock()
                .expect("mock state lock")
                .registered
                .contains(&conn_id);
            if !registered {
                // The gateway believes this conn is live; tell it to
                // drop the session.
                let _ = tx.send(BackendMsg::UnregisterSRes { conn_id });
                return;
            }
            match AppMsg::decode(&payload) {
                Ok(AppMsg::EchoReq { req_id, msg }) => {
                    if let Some(text) = msg.strip_prefix("broadcast:") {
                        let conn_ids: Vec<u64> = shared
                            .lock()
                            .expect("mock state lock")
                            .registered
                            .iter()
                            .copied()
                            .collect();
                        let _ = tx.send(BackendMsg::BroadcastSRes {
                            conn_ids,
                            payload: AppMsg::EchoResp {
                                req_id,
                                msg: text.to_owned(),
                            }
                            .encode(),
                        });
                        return;
                    }
                    if let Some(size) = msg.strip_prefix("big:").and_then(|s| s.parse().ok()) {
                        let _ = tx.send(BackendMsg::MessageSRes {
                            conn_id,
                            payload: AppMsg::EchoResp {
                                req_id,
                                msg: "x".repeat(size),
                            }
                            .encode(),
                        });
                        return;
                    }
                    let _ = tx.send(BackendMsg::MessageSRes {
                        conn_id,
                        payload: AppMsg::EchoResp { req_id, msg }.encode(),
                    });
                }
                _ => {
                    let _ = tx.send(BackendMsg::MessageSRes {
                        conn_id,
                        payload: AppMsg::ErrorResp {
                            msg: "unsupported message".into(),
                        }
                        .encode(),
                    });
                }
            }
        }
        GatewayMsg::RpcRReq { .. } | GatewayMsg::RpcRRes { .. } => {
            debug!("mock backend recording rpc envelope");
            shared.lock().expect("mock state lock").rpc_reqs.push(msg);
        }
        GatewayMsg::ServiceInstIRes { .. } => {
            shared
                .lock()
                .expect("mock state lock")
                .instance_lists
                .push(msg);
        }
        GatewayMsg::Segment { .. } => {}
    }
}
