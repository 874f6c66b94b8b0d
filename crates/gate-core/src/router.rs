//! Routing of backend-originated envelopes across a service's instances.
//!
//! Routing is best-effort and unordered relative to normal traffic:
//! failures on individual instances are logged, never propagated, and
//! callers that need ordering must send over a single instance's uplink.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{error, warn};

use gate_proto::transfer::{ROUTE_TYPE_ALL, ROUTE_TYPE_SERVICE};

use crate::service::Service;

pub trait Router: Send + Sync {
    /// Forwards `payload` (complete frame bytes, no re-encode) to the
    /// instances selected by `router_type` / `router_id`.
    fn route(
        &self,
        services: &DashMap<String, Arc<Service>>,
        router_type: i16,
        router_id: &str,
        payload: &[u8],
    );
}

/// Default routing disciplines: `0` fans out to every live instance,
/// `-1` targets one instance by id, anything else is reserved.
#[derive(Debug, Default)]
pub struct CommonRouter;

impl Router for CommonRouter {
    fn route(
        &self,
        services: &DashMap<String, Arc<Service>>,
        router_type: i16,
        router_id: &str,
        payload: &[u8],
    ) {
        match router_type {
            ROUTE_TYPE_ALL => {
                for entry in services.iter() {
                    let srv = entry.value();
                    if srv.is_stopped() {
                        continue;
                    }
                    if let Err(e) = srv.transfer_message(payload) {
                        error!(
                            instance_id = %entry.key(),
                            router_id,
                            error = %e,
                            "route fan-out failed for instance"
                        );
                    }
                }
            }
            ROUTE_TYPE_SERVICE => match services.get(router_id) {
                Some(srv) if !srv.is_stopped() => {
                    if let Err(e) = srv.transfer_message(payload) {
                        error!(instance_id = router_id, error = %e, "route to instance failed");
                    }
                }
                _ => warn!(instance_id = router_id, "route target missing or stopped"),
            },
            other => warn!(router_type = other, router_id, "unknown router type"),
        }
    }
}
