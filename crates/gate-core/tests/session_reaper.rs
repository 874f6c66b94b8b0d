//! Session expiry: unregistered sessions die at their fixed deadline,
//! registered sessions live as long as heartbeats keep arriving.

mod common;

use std::sync::Arc;
use std::time::Duration;

use gate_proto::ByteOrder;
use gate_proto::user::{ClientMsg, ServerMsg, code};
use gate_test_utils::app_msg::AppMsg;
use gate_test_utils::instance;
use gate_test_utils::memory_registry::InMemoryRegistry;
use gate_test_utils::user_client::TcpUserClient;

use common::{RECV_TIMEOUT, USER_AUTH, base_options, start_backend, start_gateway, wait_certified};

fn reaper_options() -> gate_core::Options {
    let mut options = base_options("tcp");
    options.unregistered_sender_expiration = 400;
    options.registered_sender_expiration = 800;
    options.clean_sender_session_cache_interval = Duration::from_millis(150);
    options
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn idle_unregistered_session_is_reaped() {
    let registry = Arc::new(InMemoryRegistry::new());
    let harness = start_gateway(registry, &["echo"], reaper_options()).await;

    let mut user = TcpUserClient::connect(harness.user_addr(), ByteOrder::Little)
        .await
        .unwrap();

    // No login, no traffic: the fixed pre-register deadline expires and
    // the reaper closes the connection.
    assert_eq!(user.recv(Duration::from_secs(3)).await, None);

    harness.gateway.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn heartbeats_keep_a_registered_session_alive() {
    let backend = start_backend("echo", "ts-1").await;
    let registry = Arc::new(InMemoryRegistry::new());
    registry.push("echo", vec![instance("echo", "ts-1", backend.addr(), 1)]);
    let harness = start_gateway(registry, &["echo"], reaper_options()).await;
    wait_certified(&backend, 1).await;

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
        payload: AppMsg::LoginReq { req_id: 1, uid: 3 }.encode(),
    })
    .await
    .unwrap();
    assert!(user.recv(RECV_TIMEOUT).await.is_some());

    // Outlive the registered TTL several times over on heartbeats only.
    for _ in 0..10 {
        user.send(&ClientMsg::HeartbeatReq { payload: vec![] }).await.unwrap();
        assert!(
            matches!(
                user.recv(RECV_TIMEOUT).await,
                Some(ServerMsg::HeartbeatRes {
                    code: code::SUCCESS,
                    ..
                })
            ),
            "heartbeat should keep round-tripping"
        );
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    // Still functional after three seconds of heartbeat-only traffic.
    user.send(&ClientMsg::MessageReq {
        service: String::new(),
        payload: AppMsg::EchoReq {
            req_id: 2,
            msg: "still here".into(),
        }
        .encode(),
    })
    .await
    .unwrap();
    let res = user.recv(RECV_TIMEOUT).await.expect("echo after heartbeats");
    assert!(matches!(res, ServerMsg::MessageRes { code: c, .. } if c == code::SUCCESS));

    harness.gateway.stop().await;
    backend.stop();
}
