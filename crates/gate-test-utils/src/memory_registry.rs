//! In-memory naming registry.
//!
//! Tests seed instance lists and push updates; subscribed callbacks are
//! invoked inline with the full new list, just like a real naming
//! client would on its own notification thread.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use gate_core::error::RegistryError;
use gate_core::registry::{InstanceInfo, Registry, RegistryCallback, ServiceQuery};

#[derive(Default)]
pub struct InMemoryRegistry {
    state: Mutex<State>,
    /// When set, `get_service` fails; models an unreachable registry.
    unavailable: std::sync::atomic::AtomicBool,
}

#[derive(Default)]
struct State {
    instances: HashMap<String, Vec<InstanceInfo>>,
    subscribers: HashMap<String, Vec<RegistryCallback>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, value: bool) {
        self.unavailable
            .store(value, std::sync::atomic::Ordering::Release);
    }

    /// Replaces a service's instance list and notifies subscribers.
    pub fn push(&self, service: &str, instances: Vec<InstanceInfo>) {
        let callbacks = {
            let mut state = self.state.lock().expect("registry state lock");
            state
                .instances
                .insert(service.to_owned(), instances.clone());
            state
                .subscribers
                .get(service)
                .cloned()
                .unwrap_or_default()
        };
        for callback in callbacks {
            callback(instances.clone());
        }
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn get_service(&self, query: &ServiceQuery) -> Result<Vec<InstanceInfo>, RegistryError> {
        if self.unavailable.load(std::sync::atomic::Ordering::Acquire) {
            return Err(RegistryError("naming registry unreachable".into()));
        }
        let state = self.state.lock().expect("registry state lock");
        Ok(state
            .instances
            .get(&query.service_name)
            .cloned()
            .unwrap_or_default())
    }

    async fn subscribe(
        &self,
        query: &ServiceQuery,
        callback: RegistryCallback,
    ) -> Result<(), RegistryError> {
        let mut state = self.state.lock().expect("registry state lock");
        state
            .subscribers
            .entry(query.service_name.clone())
            .or_default()
            .push(callback);
        Ok(())
    }

    async fn unsubscribe(&self, query: &ServiceQuery) -> Result<(), RegistryError> {
        let mut state = self.state.lock().expect("registry state lock");
        state.subscribers.remove(&query.service_name);
        Ok(())
    }
}
