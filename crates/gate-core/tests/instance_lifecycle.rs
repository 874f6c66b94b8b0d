//! Instance lifecycle driven through registry updates: disable windows,
//! stop deadlines, recovery, and identity pinning.

mod common;

use std::sync::Arc;
use std::time::Duration;

use gate_test_utils::instance;
use gate_test_utils::memory_registry::InMemoryRegistry;

use gate_core::error::ServiceError;

use common::{base_options, start_backend, start_gateway, wait_certified, wait_until};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disabled_instance_leaves_selection_then_stops() {
    let b1 = start_backend("echo", "ts-1").await;
    let b2 = start_backend("echo", "ts-2").await;
    let registry = Arc::new(InMemoryRegistry::new());
    registry.push(
        "echo",
        vec![
            instance("echo", "ts-1", b1.addr(), 1),
            instance("echo", "ts-2", b2.addr(), 1),
        ],
    );

    let mut options = base_options("tcp");
    options.transfer_disable_timeout = 400;
    let harness = start_gateway(registry.clone(), &["echo"], options).await;
    wait_certified(&b1, 1).await;
    wait_certified(&b2, 1).await;

    let manager = harness.gateway.transfer().manager("echo").expect("manager");
    let ts1 = manager.instance("ts-1").expect("ts-1 present");

    // Mark ts-1 disabled; ts-2 stays up.
    let mut disabled = instance("echo", "ts-1", b1.addr(), 1);
    disabled.enable = false;
    registry.push(
        "echo",
        vec![disabled, instance("echo", "ts-2", b2.addr(), 1)],
    );

    assert!(
        wait_until(Duration::from_secs(2), || {
            manager.instance_ids() == vec!["ts-2".to_owned()]
        })
        .await,
        "enabled snapshot should shrink to ts-2"
    );

    // New bindings never pick the disabled instance.
    for i in 0..50 {
        let picked = manager
            .select_instance(&format!("u-{i}"))
            .expect("selection works");
        let info = picked.expect("ts-2 available").info();
        assert_eq!(info.instance_id(), "ts-2");
    }

    // Sessions still bound to ts-1 see the disabled state immediately.
    assert_eq!(
        ts1.send_message(gate_proto::transfer::GatewayMsg::MessageSReq {
            conn_id: 1,
            payload: vec![],
        }),
        Err(ServiceError::DisabledService)
    );

    // Past the disable window the instance is stopped and removed.
    assert!(
        wait_until(Duration::from_secs(3), || manager.instance("ts-1").is_none()).await,
        "disabled instance should stop and be removed"
    );
    assert!(ts1.is_stopped());
    assert_eq!(
        ts1.send_message(gate_proto::transfer::GatewayMsg::MessageSReq {
            conn_id: 1,
            payload: vec![],
        }),
        Err(ServiceError::StoppedInstance)
    );

    harness.gateway.stop().await;
    b1.stop();
    b2.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn vanished_instance_is_disabled() {
    let b1 = start_backend("echo", "ts-1").await;
    let b2 = start_backend("echo", "ts-2").await;
    let registry = Arc::new(InMemoryRegistry::new());
    registry.push(
        "echo",
        vec![
            instance("echo", "ts-1", b1.addr(), 1),
            instance("echo", "ts-2", b2.addr(), 1),
        ],
    );
    let harness = start_gateway(registry.clone(), &["echo"], base_options("tcp")).await;
    wait_certified(&b1, 1).await;

    let manager = harness.gateway.transfer().manager("echo").expect("manager");
    assert!(
        wait_until(Duration::from_secs(2), || manager.instance_ids().len() == 2).await
    );

    // ts-1 drops out of the registry list entirely.
    registry.push("echo", vec![instance("echo", "ts-2", b2.addr(), 1)]);

    assert!(
        wait_until(Duration::from_secs(2), || {
            manager.instance_ids() == vec!["ts-2".to_owned()]
        })
        .await
    );
    let ts1 = manager.instance("ts-1").expect("still tracked while disabled");
    assert!(!ts1.is_enable());

    harness.gateway.stop().await;
    b1.stop();
    b2.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reenabled_instance_reconnects() {
    let backend = start_backend("echo", "ts-1").await;
    let registry = Arc::new(InMemoryRegistry::new());
    registry.push("echo", vec![instance("echo", "ts-1", backend.addr(), 1)]);

    let mut options = base_options("tcp");
    options.transfer_disable_timeout = 60_000;
    let harness = start_gateway(registry.clone(), &["echo"], options).await;
    wait_certified(&backend, 1).await;

    let mut disabled = instance("echo", "ts-1", backend.addr(), 1);
    disabled.enable = false;
    registry.push("echo", vec![disabled]);

    let manager = harness.gateway.transfer().manager("echo").expect("manager");
    assert!(
        wait_until(Duration::from_secs(2), || manager.instance_ids().is_empty()).await
    );

    // Back to enabled + healthy: the instance re-initializes and, once
    // the backoff window passes, handshakes again.
    registry.push("echo", vec![instance("echo", "ts-1", backend.addr(), 1)]);
    assert!(
        wait_until(Duration::from_secs(8), || backend.handshakes().len() >= 2).await,
        "expected a second uplink handshake after re-enable"
    );

    harness.gateway.stop().await;
    backend.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn identity_change_is_rejected() {
    let backend = start_backend("echo", "ts-1").await;
    let registry = Arc::new(InMemoryRegistry::new());
    registry.push("echo", vec![instance("echo", "ts-1", backend.addr(), 1)]);
    let harness = start_gateway(registry.clone(), &["echo"], base_options("tcp")).await;
    wait_certified(&backend, 1).await;

    let manager = harness.gateway.transfer().manager("echo").expect("manager");
    let old_port = backend.addr().port();

    // Same instance id, different port: the update must not apply.
    let mut moved = instance("echo", "ts-1", backend.addr(), 1);
    moved.port = old_port.wrapping_add(1);
    registry.push("echo", vec![moved]);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let info = manager.instance("ts-1").expect("instance kept").info();
    assert_eq!(info.port, old_port);

    harness.gateway.stop().await;
    backend.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn instances_without_metadata_id_are_dropped() {
    let backend = start_backend("echo", "ts-1").await;
    let registry = Arc::new(InMemoryRegistry::new());
    let mut anonymous = instance("echo", "ts-1", backend.addr(), 1);
    anonymous.metadata.clear();
    registry.push(
        "echo",
        vec![anonymous, instance("echo", "ts-1", backend.addr(), 1)],
    );
    let harness = start_gateway(registry, &["echo"], base_options("tcp")).await;
    wait_certified(&backend, 1).await;

    let manager = harness.gateway.transfer().manager("echo").expect("manager");
    assert!(
        wait_until(Duration::from_secs(2), || {
            manager.instance_ids() == vec!["ts-1".to_owned()]
        })
        .await
    );

    harness.gateway.stop().await;
    backend.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn handshake_resumes_registered_conns_after_reconnect() {
    let backend = start_backend("echo", "ts-1").await;
    let registry = Arc::new(InMemoryRegistry::new());
    registry.push("echo", vec![instance("echo", "ts-1", backend.addr(), 1)]);
    let harness = start_gateway(registry, &["echo"], base_options("tcp")).await;
    wait_certified(&backend, 1).await;

    // First handshake advertises nothing.
    let gate_proto::transfer::GatewayMsg::HandshakeReq { conn_ids, .. } =
        backend.handshakes()[0].clone()
    else {
        panic!("expected a handshake request");
    };
    assert!(conn_ids.is_empty());

    // Register one user, then force the uplink down.
    let mut user =
        gate_test_utils::user_client::TcpUserClient::connect(harness.user_addr(), gate_proto::ByteOrder::Little)
            .await
            .unwrap();
    user.send(&gate_proto::user::ClientMsg::HandshakeReq {
        router_id: "0".into(),
        auth_key: common::USER_AUTH.into(),
        service: "echo".into(),
    })
    .await
    .unwrap();
    assert!(user.recv(common::RECV_TIMEOUT).await.is_some());
    user.send(&gate_proto::user::ClientMsg::MessageReq {
        service: String::new(),
        payload: gate_test_utils::app_msg::AppMsg::LoginReq { req_id: 1, uid: 5 }.encode(),
    })
    .await
    .unwrap();
    assert!(user.recv(common::RECV_TIMEOUT).await.is_some());
    let registered = backend.registered_conns();
    assert_eq!(registered.len(), 1);
    let conn_id = *registered.iter().next().unwrap();

    // Kill the backend and stand a fresh one up on the same port; the
    // gateway reconnects under backoff and replays the registered conn
    // in its next handshake.
    let addr = backend.addr();
    backend.stop();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let backend2 = gate_test_utils::mock_backend::MockBackend::start_on(
        &addr.to_string(),
        gate_test_utils::mock_backend::MockBackendConfig::new("echo", "ts-1", common::S2S_AUTH),
    )
    .await
    .expect("backend restarts on the same port");

    assert!(
        wait_until(Duration::from_secs(15), || {
            backend2.handshakes().iter().any(|h| {
                matches!(
                    h,
                    gate_proto::transfer::GatewayMsg::HandshakeReq { conn_ids, .. }
                    if conn_ids.contains(&conn_id)
                )
            })
        })
        .await,
        "reconnect handshake should replay the registered conn id"
    );

    harness.gateway.stop().await;
    backend2.stop();
    let _ = user;
}
