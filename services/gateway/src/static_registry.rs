//! File-configured discovery.
//!
//! Deployments without a naming service list their backend instances in
//! the gateway's TOML config; the list is served once at startup and
//! never changes.  Anything dynamic should wire a real registry into
//! [`gate_core::Registry`] instead.

use std::collections::HashMap;

use async_trait::async_trait;

use gate_core::error::RegistryError;
use gate_core::registry::{
    InstanceInfo, METADATA_KEY_ID, Registry, RegistryCallback, ServiceQuery,
};

use crate::config::StaticInstance;

pub struct StaticRegistry {
    instances: HashMap<String, Vec<InstanceInfo>>,
}

impl StaticRegistry {
    pub fn new(entries: &[StaticInstance]) -> Self {
        let mut instances: HashMap<String, Vec<InstanceInfo>> = HashMap::new();
        for entry in entries {
            instances
                .entry(entry.service.clone())
                .or_default()
                .push(InstanceInfo {
                    service_name: entry.service.clone(),
                    ip: entry.ip.clone(),
                    port: entry.port,
                    weight: entry.weight,
                    healthy: true,
                    enable: true,
                    cluster: String::new(),
                    metadata: HashMap::from([(METADATA_KEY_ID.to_owned(), entry.id.clone())]),
                });
        }
        StaticRegistry { instances }
    }
}

#[async_trait]
impl Registry for StaticRegistry {
    async fn get_service(&self, query: &ServiceQuery) -> Result<Vec<InstanceInfo>, RegistryError> {
        Ok(self
            .instances
            .get(&query.service_name)
            .cloned()
            .unwrap_or_default())
    }

    async fn subscribe(
        &self,
        _query: &ServiceQuery,
        _callback: RegistryCallback,
    ) -> Result<(), RegistryError> {
        // Static lists never change; there is nothing to deliver.
        Ok(())
    }

    async fn unsubscribe(&self, _query: &ServiceQuery) -> Result<(), RegistryError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serves_configured_instances() {
        let registry = StaticRegistry::new(&[StaticInstance {
            service: "echo".into(),
            id: "ts-1".into(),
            ip: "127.0.0.1".into(),
            port: 9500,
            weight: 2,
        }]);
        let query = ServiceQuery {
            service_name: "echo".into(),
            group: String::new(),
        };
        let list = registry.get_service(&query).await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].instance_id(), "ts-1");
        assert_eq!(list[0].weight, 2);

        let none = registry
            .get_service(&ServiceQuery {
                service_name: "nope".into(),
                group: String::new(),
            })
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}
