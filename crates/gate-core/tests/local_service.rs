//! Local mode: the discovered instance id equals this gateway's own app
//! id, so traffic short-circuits to an in-process handler instead of
//! crossing an uplink.

mod common;

use std::sync::Arc;

use gate_core::handler::{BackendSession, HandlerError, MessageHandler};
use gate_proto::ByteOrder;
use gate_proto::transfer::{BackendMsg, GatewayMsg, code as tcode};
use gate_proto::user::{ClientMsg, ServerMsg, code};
use gate_test_utils::app_msg::AppMsg;
use gate_test_utils::instance;
use gate_test_utils::memory_registry::InMemoryRegistry;
use gate_test_utils::user_client::TcpUserClient;

use common::{RECV_TIMEOUT, USER_AUTH, base_options, start_gateway};

/// Minimal in-process echo service.
struct LocalEcho;

impl MessageHandler for LocalEcho {
    fn handle_message(
        &self,
        session: &dyn BackendSession,
        msg: GatewayMsg,
    ) -> Result<(), HandlerError> {
        match msg {
            GatewayMsg::RegisterSReq { conn_id, payload } => {
                let AppMsg::LoginReq { req_id, uid } = AppMsg::decode(&payload)? else {
                    session.send_message(BackendMsg::RegisterSRes {
                        conn_id,
                        code: tcode::AUTH_FAILED,
                        router_id: String::new(),
                        payload: Vec::new(),
                    });
                    return Ok(());
                };
                session.send_message(BackendMsg::RegisterSRes {
                    conn_id,
                    code: tcode::SUCCESS,
                    router_id: format!("u-{uid}"),
                    payload: AppMsg::LoginResp {
                        req_id,
                        msg: "ok".into(),
                    }
                    .encode(),
                });
            }
            GatewayMsg::MessageSReq { conn_id, payload } => {
                let AppMsg::EchoReq { req_id, msg } = AppMsg::decode(&payload)? else {
                    return Ok(());
                };
                session.send_message(BackendMsg::MessageSRes {
                    conn_id,
                    payload: AppMsg::EchoResp { req_id, msg }.encode(),
                });
            }
            GatewayMsg::HeartbeatSReq { conn_id, payload } => {
                session.send_message(BackendMsg::HeartbeatSRes { conn_id, payload });
            }
            _ => {}
        }
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn local_instance_serves_users_in_process() {
    let registry = Arc::new(InMemoryRegistry::new());
    // The advertised instance id equals the gateway's app id, so no
    // uplink is ever dialed; the address is never used.
    registry.push(
        "echo",
        vec![instance("echo", "gw-1", "127.0.0.1:1".parse().unwrap(), 1)],
    );

    let mut options = base_options("tcp");
    options
        .service_message_handler
        .insert("echo".to_owned(), Arc::new(LocalEcho));
    let harness = start_gateway(registry, &["echo"], options).await;

    let mut user = TcpUserClient::connect(harness.user_addr(), ByteOrder::Little)
        .await
        .unwrap();
    user.send(&ClientMsg::HandshakeReq {
        router_id: "0".into(),
        auth_key: USER_AUTH.into(),
        service: "echo".into(),
    })
    .await
    .unwrap();
    assert_eq!(
        user.recv(RECV_TIMEOUT).await,
        Some(ServerMsg::HandshakeRes {
            code: code::SUCCESS
        })
    );

    user.send(&ClientMsg::MessageReq {
        service: String::new(),
        payload: AppMsg::LoginReq { req_id: 1, uid: 11 }.encode(),
    })
    .await
    .unwrap();
    let res = user.recv(RECV_TIMEOUT).await.expect("login response");
    let ServerMsg::MessageRes { code: c, payload } = res else {
        panic!("expected MessageRes, got {res:?}");
    };
    assert_eq!(c, code::SUCCESS);
    assert_eq!(
        AppMsg::decode(&payload).unwrap(),
        AppMsg::LoginResp {
            req_id: 1,
            msg: "ok".into()
        }
    );

    user.send(&ClientMsg::MessageReq {
        service: String::new(),
        payload: AppMsg::EchoReq {
            req_id: 2,
            msg: "local hi".into(),
        }
        .encode(),
    })
    .await
    .unwrap();
    let res = user.recv(RECV_TIMEOUT).await.expect("echo response");
    let ServerMsg::MessageRes { payload, .. } = res else {
        panic!("expected MessageRes");
    };
    assert_eq!(
        AppMsg::decode(&payload).unwrap(),
        AppMsg::EchoResp {
            req_id: 2,
            msg: "local hi".into()
        }
    );

    // Heartbeats loop through the handler too.
    user.send(&ClientMsg::HeartbeatReq {
        payload: b"hb".to_vec(),
    })
    .await
    .unwrap();
    assert_eq!(
        user.recv(RECV_TIMEOUT).await,
        Some(ServerMsg::HeartbeatRes {
            code: code::SUCCESS,
            payload: b"hb".to_vec()
        })
    );

    harness.gateway.stop().await;
}
