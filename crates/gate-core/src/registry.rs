//! Naming registry surface the gateway consumes.
//!
//! The concrete discovery backend lives outside this crate; the core
//! only needs instance lists and change callbacks.  Cluster filtering is
//! applied by the gateway, not the registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::RegistryError;

/// Identity of this gateway process.
#[derive(Debug, Clone, Default)]
pub struct AppInfo {
    /// Instance id of this gateway.  A discovered backend instance whose
    /// id equals this one is served in-process (Local mode).
    pub id: String,
    /// Cluster this gateway belongs to; discovered instances from other
    /// clusters are ignored.  Empty disables the filter.
    pub cluster: String,
    /// Naming group used for registry queries.
    pub group: String,
}

/// Metadata key the instance id is published under.
pub const METADATA_KEY_ID: &str = "id";

/// Descriptor of one backend instance as the registry reports it.
///
/// Immutable once observed; updates replace the whole record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub service_name: String,
    pub ip: String,
    pub port: u16,
    pub weight: u32,
    pub healthy: bool,
    pub enable: bool,
    pub cluster: String,
    pub metadata: HashMap<String, String>,
}

impl InstanceInfo {
    /// The instance id from the naming metadata.  Distinct from the
    /// naming system's own host record; empty when unpublished.
    pub fn instance_id(&self) -> &str {
        self.metadata
            .get(METADATA_KEY_ID)
            .map(String::as_str)
            .unwrap_or("")
    }

    /// The bare service name, with any `group@@` prefix stripped.
    pub fn service(&self) -> &str {
        match self.service_name.find("@@") {
            Some(i) => &self.service_name[i + 2..],
            None => &self.service_name,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Query parameters for one watched service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceQuery {
    pub service_name: String,
    pub group: String,
}

/// Change callback: receives the full new instance list.
pub type RegistryCallback = Arc<dyn Fn(Vec<InstanceInfo>) + Send + Sync>;

/// The naming registry the transfer core subscribes to.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Current instances of a service.
    async fn get_service(&self, query: &ServiceQuery) -> Result<Vec<InstanceInfo>, RegistryError>;

    /// Subscribe to changes; the callback receives full lists and may be
    /// invoked from any task.
    async fn subscribe(
        &self,
        query: &ServiceQuery,
        callback: RegistryCallback,
    ) -> Result<(), RegistryError>;

    async fn unsubscribe(&self, query: &ServiceQuery) -> Result<(), RegistryError>;
}
