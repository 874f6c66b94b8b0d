//! Service manager: one per watched service name.
//!
//! Owns the `instance id → Service` map, reconciles it against registry
//! updates, publishes the enabled-instance snapshot to its selector, and
//! routes by instance id.  Mutations are serialized through shard 0 of
//! the executor; readers go through the concurrent map and the
//! atomically swapped snapshot.

use std::sync::{Arc, RwLock, Weak};

use dashmap::DashMap;
use tracing::{debug, error, warn};

use crate::error::{SelectorError, ServiceError};
use crate::options::Options;
use crate::registry::{AppInfo, InstanceInfo};
use crate::router::Router;
use crate::selector::Selector;
use crate::service::{Local, Remote, Service};
use crate::transfer::TransferInner;

pub struct Manager {
    transfer: Weak<TransferInner>,
    service: String,
    options: Arc<Options>,
    app_info: AppInfo,
    services: DashMap<String, Arc<Service>>,
    enabled: RwLock<Arc<Vec<InstanceInfo>>>,
    selector: Box<dyn Selector>,
    router: Arc<dyn Router>,
}

impl Manager {
    pub(crate) fn new(
        transfer: Weak<TransferInner>,
        service: String,
        options: Arc<Options>,
        app_info: AppInfo,
        selector: Box<dyn Selector>,
        router: Arc<dyn Router>,
    ) -> Self {
        Manager {
            transfer,
            service,
            options,
            app_info,
            services: DashMap::new(),
            enabled: RwLock::new(Arc::new(Vec::new())),
            selector,
            router,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service
    }

    /// Reconciles the instance map with a full registry list.
    ///
    /// New usable instances are constructed (Local when the id is our
    /// own app id) and connected; instances missing from the list are
    /// delivered a synthesized `enable = false` update so their state
    /// machine can wind down; the rest get the update verbatim.  The
    /// enabled snapshot and the selector are refreshed atomically at the
    /// end.
    pub fn update_instances(&self, instances: Vec<InstanceInfo>) {
        let mut incoming: std::collections::HashMap<String, Option<InstanceInfo>> =
            std::collections::HashMap::with_capacity(instances.len());
        let mut enabled: Vec<InstanceInfo> = Vec::with_capacity(instances.len());

        for info in instances {
            let id = info.instance_id().to_owned();
            if id.is_empty() {
                warn!(service = %self.service, ip = %info.ip, port = info.port, "instance without metadata id dropped");
                continue;
            }
            if self.services.contains_key(&id) {
                incoming.insert(id, Some(info));
                continue;
            }
            if !info.enable || !info.healthy {
                // Unusable and unknown: nothing to build yet.
                incoming.insert(id, None);
                continue;
            }
            match self.build_service(info.clone()) {
                Ok(service) => {
                    self.services.insert(id.clone(), service);
                    enabled.push(info);
                }
                Err(e) => {
                    error!(service = %self.service, instance_id = %id, error = %e, "cannot build service instance");
                }
            }
            incoming.insert(id, None);
        }

        for entry in self.services.iter() {
            let (id, srv) = (entry.key(), entry.value());
            match incoming.get(id) {
                // Added this round; already accounted for.
                Some(None) => continue,
                Some(Some(new_info)) => {
                    if let Err(e) = srv.update_info(new_info.clone()) {
                        error!(service = %self.service, instance_id = %id, error = %e, "instance update rejected");
                    }
                }
                None => {
                    // Vanished from the registry: disable it and let the
                    // keepalive deadline stop it.
                    let mut synthesized = srv.info();
                    synthesized.enable = false;
                    if let Err(e) = srv.update_info(synthesized) {
                        error!(service = %self.service, instance_id = %id, error = %e, "instance disable rejected");
                    }
                }
            }
            if srv.is_enable() {
                enabled.push(srv.info());
            }
        }

        self.selector.update(&enabled);
        *self.enabled.write().expect("enabled snapshot lock") = Arc::new(enabled);
    }

    fn build_service(&self, info: InstanceInfo) -> Result<Arc<Service>, ServiceError> {
        if info.instance_id() == self.app_info.id {
            let local = Local::new(self.transfer.clone(), &self.options, info)?;
            return Ok(Arc::new(Service::Local(local)));
        }
        let remote = Remote::new(
            self.transfer.clone(),
            self.options.clone(),
            self.app_info.clone(),
            info,
        );
        if let Err(e) = remote.connect() {
            error!(service = %self.service, error = %e, "initial connect failed");
        }
        Ok(Arc::new(Service::Remote(remote)))
    }

    /// Drives every instance's keepalive; stopped ones are removed.
    pub fn keep_clients_alive(&self) {
        self.services.retain(|id, srv| {
            let alive = srv.keep_alive();
            if !alive {
                debug!(service = %self.service, instance_id = %id, "removing stopped instance");
            }
            alive
        });
    }

    /// Picks an open instance for a router id.  `Ok(None)` when nothing
    /// usable exists right now.
    pub fn select_instance(&self, router_id: &str) -> Result<Option<Arc<Service>>, SelectorError> {
        let id = match self.selector.select(router_id) {
            Ok(id) => id,
            Err(SelectorError::EmptyInstances) => None,
            Err(e) => return Err(e),
        };
        Ok(id.and_then(|id| self.open_service(&id)))
    }

    fn open_service(&self, instance_id: &str) -> Option<Arc<Service>> {
        if instance_id.is_empty() {
            return None;
        }
        let Some(srv) = self.services.get(instance_id) else {
            warn!(service = %self.service, instance_id, "selected instance not found");
            return None;
        };
        if srv.is_stopped() {
            warn!(service = %self.service, instance_id, "selected instance is stopped");
            return None;
        }
        Some(srv.value().clone())
    }

    /// Delegates a routing envelope to the router over this manager's
    /// instance map.
    pub fn route(&self, router_type: i16, router_id: &str, payload: &[u8]) {
        self.router
            .route(&self.services, router_type, router_id, payload);
    }

    /// Instance ids of the current enabled snapshot.
    pub fn instance_ids(&self) -> Vec<String> {
        self.enabled
            .read()
            .expect("enabled snapshot lock")
            .iter()
            .map(|i| i.instance_id().to_owned())
            .collect()
    }

    /// The current enabled snapshot.
    pub fn enabled_instances(&self) -> Arc<Vec<InstanceInfo>> {
        self.enabled.read().expect("enabled snapshot lock").clone()
    }

    pub(crate) fn stop_all(&self) {
        for entry in self.services.iter() {
            if let Err(e) = entry.value().stop() {
                debug!(service = %self.service, instance_id = %entry.key(), error = %e, "stop instance");
            }
        }
    }

    pub fn instance(&self, instance_id: &str) -> Option<Arc<Service>> {
        self.services.get(instance_id).map(|s| s.value().clone())
    }
}
