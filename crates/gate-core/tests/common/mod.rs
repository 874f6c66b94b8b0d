//! Shared harness for the gateway integration tests: a gateway over an
//! in-memory registry, tuned to test-friendly timings, bound to
//! ephemeral loopback ports.

// Not every suite touches every helper.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use gate_core::{AppInfo, Gateway, Options};
use gate_test_utils::memory_registry::InMemoryRegistry;
use gate_test_utils::mock_backend::{MockBackend, MockBackendConfig};

pub const USER_AUTH: &str = "123";
pub const S2S_AUTH: &str = "s2s-secret";
pub const RECV_TIMEOUT: Duration = Duration::from_secs(3);

pub struct Harness {
    pub gateway: Gateway,
    pub registry: Arc<InMemoryRegistry>,
}

impl Harness {
    pub fn user_addr(&self) -> SocketAddr {
        self.gateway
            .receiver()
            .local_addr()
            .expect("receiver bound")
    }
}

pub fn base_options(proto: &str) -> Options {
    Options {
        receiver_auth_key: USER_AUTH.to_owned(),
        receiver_proto_addr: format!("{proto}://127.0.0.1:0"),
        transfer_auth_key: S2S_AUTH.to_owned(),
        transfer_keep_alive_interval: Duration::from_millis(100),
        ..Options::default()
    }
}

/// Starts a gateway watching `services` against `registry`.
pub async fn start_gateway(
    registry: Arc<InMemoryRegistry>,
    services: &[&str],
    mut options: Options,
) -> Harness {
    options.registry_service_names = services.iter().map(|s| (*s).to_owned()).collect();
    let app = AppInfo {
        id: "gw-1".to_owned(),
        cluster: String::new(),
        group: String::new(),
    };
    let gateway = Gateway::new(app, options, registry.clone());
    gateway.start().await.expect("gateway starts");
    Harness { gateway, registry }
}

pub async fn start_backend(service: &str, service_id: &str) -> MockBackend {
    MockBackend::start(MockBackendConfig::new(service, service_id, S2S_AUTH))
        .await
        .expect("mock backend starts")
}

/// Polls `cond` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Waits for the gateway's uplink to the backend to be certified: the
/// backend has seen a handshake, plus a grace period for the response
/// to land.
pub async fn wait_certified(backend: &MockBackend, handshakes: usize) {
    assert!(
        wait_until(Duration::from_secs(5), || {
            backend.handshakes().len() >= handshakes
        })
        .await,
        "uplink never handshook"
    );
    tokio::time::sleep(Duration::from_millis(150)).await;
}
