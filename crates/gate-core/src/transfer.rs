//! Transfer core: executor, managers, registry glue, periodic work.
//!
//! Owns one [`Manager`] per watched service, the sharded executor every
//! session mutation goes through, and the two periodic passes (uplink
//! keepalive, session reaper).  Registry callbacks arrive on unknown
//! tasks and are re-entered through shard 0 before touching any manager
//! state.  Children keep weak back-pointers; the transfer owns its
//! managers, the managers own their services.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{ExecutorError, GatewayError};
use crate::executor::{ShardLocal, ShardedExecutor};
use crate::manager::Manager;
use crate::now_millis;
use crate::options::Options;
use crate::registry::{AppInfo, InstanceInfo, Registry, ServiceQuery};
use crate::router::{CommonRouter, Router};
use crate::selector::{CacheSelector, CompositeSelector, Selector, WeightSelector};

pub struct Transfer {
    pub(crate) inner: Arc<TransferInner>,
}

pub(crate) struct TransferInner {
    pub(crate) app_info: AppInfo,
    pub(crate) options: Arc<Options>,
    pub(crate) executor: ShardedExecutor,
    router: Arc<dyn Router>,
    registry: Arc<dyn Registry>,
    managers: OnceLock<HashMap<String, Arc<Manager>>>,
    shutdown: CancellationToken,
}

impl Transfer {
    pub fn new(app_info: AppInfo, options: Options, registry: Arc<dyn Registry>) -> Self {
        let options = Arc::new(options);
        let executor = ShardedExecutor::new(
            options.executor_workers(),
            options.message_executor_queue_length,
        );
        let router: Arc<dyn Router> = options
            .service_router
            .clone()
            .unwrap_or_else(|| Arc::new(CommonRouter));
        Transfer {
            inner: Arc::new(TransferInner {
                app_info,
                options,
                executor,
                router,
                registry,
                managers: OnceLock::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Builds the managers, loads the initial instance lists (failing
    /// fast when the registry is unreachable), subscribes for changes,
    /// and schedules the periodic passes.
    pub async fn start(&self) -> Result<(), GatewayError> {
        let inner = &self.inner;
        let mut managers = HashMap::new();
        for name in &inner.options.registry_service_names {
            let manager = Arc::new(Manager::new(
                Arc::downgrade(inner),
                name.clone(),
                inner.options.clone(),
                inner.app_info.clone(),
                inner.make_selector(),
                inner.router.clone(),
            ));
            managers.insert(name.clone(), manager);
        }
        if inner.managers.set(managers).is_err() {
            return Err(GatewayError::AlreadyStarted);
        }

        for name in &inner.options.registry_service_names {
            let query = ServiceQuery {
                service_name: name.clone(),
                group: inner.app_info.group.clone(),
            };
            let instances = inner.registry.get_service(&query).await?;
            info!(service = %name, count = instances.len(), "initial instance list");
            inner.update_instances(name, instances);

            let weak = Arc::downgrade(inner);
            let callback_name = name.clone();
            inner
                .registry
                .subscribe(
                    &query,
                    Arc::new(move |instances| {
                        if let Some(inner) = weak.upgrade() {
                            inner.update_instances(&callback_name, instances);
                        }
                    }),
                )
                .await?;
        }

        inner.spawn_keep_alive();
        inner.spawn_session_reaper();
        Ok(())
    }

    pub async fn stop(&self) {
        let inner = &self.inner;
        inner.shutdown.cancel();
        for name in &inner.options.registry_service_names {
            let query = ServiceQuery {
                service_name: name.clone(),
                group: inner.app_info.group.clone(),
            };
            if let Err(e) = inner.registry.unsubscribe(&query).await {
                error!(service = %name, error = %e, "unsubscribe failed");
            }
        }
        if let Some(managers) = inner.managers.get() {
            for manager in managers.values() {
                manager.stop_all();
            }
        }
        inner.executor.shutdown().await;
    }

    /// Schedules `task` on the shard owning `conn_id`.  The only legal
    /// way to touch a user session or a shard-local map.
    pub fn forward(&self, conn_id: u64, task: impl FnOnce(&mut ShardLocal) + Send + 'static) {
        self.inner.forward(conn_id, task);
    }

    pub fn manager(&self, service: &str) -> Option<Arc<Manager>> {
        self.inner.manager(service)
    }

    pub fn app_info(&self) -> &AppInfo {
        &self.inner.app_info
    }

    pub fn options(&self) -> &Options {
        &self.inner.options
    }
}

impl TransferInner {
    fn make_selector(&self) -> Box<dyn Selector> {
        if let Some(factory) = &self.options.service_selector {
            return factory();
        }
        let mut stages: Vec<Box<dyn Selector>> = Vec::new();
        if let Some(cache) = &self.options.router_cache {
            stages.push(Box::new(CacheSelector::new(cache.clone())));
        }
        stages.push(Box::new(WeightSelector::new()));
        Box::new(CompositeSelector::new(stages))
    }

    pub(crate) fn manager(&self, service: &str) -> Option<Arc<Manager>> {
        self.managers.get().and_then(|m| m.get(service)).cloned()
    }

    pub(crate) fn forward(
        &self,
        conn_id: u64,
        task: impl FnOnce(&mut ShardLocal) + Send + 'static,
    ) {
        if let Err(e) = self.executor.submit(conn_id, task) {
            error!(conn_id, error = %e, "forward task rejected");
        }
    }

    /// Same as [`Self::forward`] but reports the rejection.
    pub(crate) fn try_forward(
        &self,
        conn_id: u64,
        task: impl FnOnce(&mut ShardLocal) + Send + 'static,
    ) -> Result<(), ExecutorError> {
        self.executor.submit(conn_id, task)
    }

    /// Applies a registry update.  The list is cluster-filtered here and
    /// the mutation itself runs on shard 0, keeping all manager writes
    /// single-threaded.
    pub(crate) fn update_instances(self: &Arc<Self>, service: &str, instances: Vec<InstanceInfo>) {
        let instances: Vec<InstanceInfo> = if self.app_info.cluster.is_empty() {
            instances
        } else {
            instances
                .into_iter()
                .filter(|i| i.cluster == self.app_info.cluster)
                .collect()
        };
        let weak = Arc::downgrade(self);
        let service = service.to_owned();
        if let Err(e) = self.executor.submit(0, move |_| {
            let Some(inner) = weak.upgrade() else { return };
            match inner.manager(&service) {
                Some(manager) => manager.update_instances(instances),
                None => error!(service = %service, "instance update for unknown service"),
            }
        }) {
            error!(error = %e, "instance update submission failed");
        }
    }

    fn spawn_keep_alive(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let token = self.shutdown.clone();
        let period = self.options.transfer_keep_alive_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        if let Some(managers) = inner.managers.get() {
                            for manager in managers.values() {
                                manager.keep_clients_alive();
                            }
                        }
                    }
                }
            }
        });
    }

    /// The only global coherence pass: drop closed or expired sessions
    /// from every shard local.
    fn spawn_session_reaper(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let token = self.shutdown.clone();
        let period = self.options.clean_sender_session_cache_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        let result = inner.executor.submit_to_all(
                            |local: &mut ShardLocal| {
                                let now = now_millis();
                                local.retain(|sess| {
                                    let keep = !sess.is_closed() && sess.ctx().deadline() >= now;
                                    if !keep {
                                        debug!(conn_id = sess.conn_id(), "reaping session");
                                        sess.close();
                                    }
                                    keep
                                });
                            },
                            false,
                        )
                        .await;
                        if let Err(e) = result {
                            error!(error = %e, "session reap submission failed");
                        }
                    }
                }
            }
        });
    }
}
