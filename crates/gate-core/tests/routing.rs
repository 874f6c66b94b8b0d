//! Router envelopes: targeted delivery, fan-out, and the instance-list
//! introspection request.

mod common;

use std::sync::Arc;
use std::time::Duration;

use gate_proto::ByteOrder;
use gate_proto::transfer::{BackendMsg, GatewayMsg, ROUTE_TYPE_ALL, ROUTE_TYPE_SERVICE};
use gate_test_utils::instance;
use gate_test_utils::memory_registry::InMemoryRegistry;

use common::{base_options, start_backend, start_gateway, wait_certified, wait_until};

const ORDER: ByteOrder = ByteOrder::Big;

fn rpc_frames(rpc_id: u32) -> Vec<u8> {
    GatewayMsg::RpcRReq {
        source_srv: "echo".into(),
        source_id: "ts-1".into(),
        rpc_id,
        payload: b"who is there".to_vec(),
    }
    .encode_frames(ORDER)
    .expect("rpc frames encode")
    .to_vec()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn router_envelope_targets_one_instance() {
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
    let harness = start_gateway(registry, &["echo"], base_options("tcp")).await;
    wait_certified(&b1, 1).await;
    wait_certified(&b2, 1).await;

    // ts-1 asks the gateway to deliver an rpc request to ts-2.
    b1.latest_uplink()
        .expect("uplink")
        .send(BackendMsg::MessageRouter {
            router_service: "echo".into(),
            router_type: ROUTE_TYPE_SERVICE,
            router_id: "ts-2".into(),
            payload: rpc_frames(7),
        });

    assert!(
        wait_until(Duration::from_secs(3), || !b2.rpc_reqs().is_empty()).await,
        "targeted instance should receive the rpc request"
    );
    assert!(
        matches!(
            &b2.rpc_reqs()[0],
            GatewayMsg::RpcRReq { rpc_id: 7, source_id, .. } if source_id == "ts-1"
        ),
        "payload must arrive unmodified"
    );
    assert!(b1.rpc_reqs().is_empty(), "the sender must not see it back");

    harness.gateway.stop().await;
    b1.stop();
    b2.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn router_fan_out_reaches_every_live_instance() {
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
    let harness = start_gateway(registry, &["echo"], base_options("tcp")).await;
    wait_certified(&b1, 1).await;
    wait_certified(&b2, 1).await;

    b1.latest_uplink()
        .expect("uplink")
        .send(BackendMsg::MessageRouter {
            router_service: "echo".into(),
            router_type: ROUTE_TYPE_ALL,
            router_id: String::new(),
            payload: rpc_frames(8),
        });

    assert!(
        wait_until(Duration::from_secs(3), || {
            !b1.rpc_reqs().is_empty() && !b2.rpc_reqs().is_empty()
        })
        .await,
        "fan-out should reach both instances"
    );

    harness.gateway.stop().await;
    b1.stop();
    b2.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn instance_list_request_is_answered() {
    let b1 = start_backend("echo", "ts-1").await;
    let registry = Arc::new(InMemoryRegistry::new());
    registry.push("echo", vec![instance("echo", "ts-1", b1.addr(), 1)]);
    let harness = start_gateway(registry, &["echo"], base_options("tcp")).await;
    wait_certified(&b1, 1).await;

    b1.latest_uplink()
        .expect("uplink")
        .send(BackendMsg::ServiceInstIReq {
            service: "echo".into(),
        });

    assert!(
        wait_until(Duration::from_secs(3), || !b1.instance_lists().is_empty()).await,
        "gateway should answer the instance list request"
    );
    assert!(matches!(
        &b1.instance_lists()[0],
        GatewayMsg::ServiceInstIRes { service, instance_ids }
        if service == "echo" && instance_ids == &vec!["ts-1".to_owned()]
    ));

    harness.gateway.stop().await;
    b1.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_router_service_is_dropped() {
    let b1 = start_backend("echo", "ts-1").await;
    let registry = Arc::new(InMemoryRegistry::new());
    registry.push("echo", vec![instance("echo", "ts-1", b1.addr(), 1)]);
    let harness = start_gateway(registry, &["echo"], base_options("tcp")).await;
    wait_certified(&b1, 1).await;

    b1.latest_uplink()
        .expect("uplink")
        .send(BackendMsg::MessageRouter {
            router_service: "nope".into(),
            router_type: ROUTE_TYPE_ALL,
            router_id: String::new(),
            payload: rpc_frames(9),
        });

    // Nothing arrives anywhere and nothing falls over.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(b1.rpc_reqs().is_empty());

    harness.gateway.stop().await;
    b1.stop();
}
