//! Instance selection for session binding.
//!
//! A selector answers "which instance of this service should carry this
//! router id" from the enabled-instance snapshot its manager publishes.
//! Updates replace the snapshot wholesale; a reader sees either the old
//! or the new state, never a mix.

use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use tracing::error;

use crate::error::SelectorError;
use crate::registry::InstanceInfo;

pub trait Selector: Send + Sync {
    /// Picks an instance id for `router_id`.
    ///
    /// `Ok(None)` means "healthy but nothing chosen" (a later stage may
    /// still pick); `EmptyInstances` means the selector holds no
    /// instances at all.
    fn select(&self, router_id: &str) -> Result<Option<String>, SelectorError>;

    /// Replaces the enabled-instance snapshot.
    fn update(&self, instances: &[InstanceInfo]);
}

/// Sticky-session lookup consulted before load balancing.  Implemented
/// by the embedder over whatever cache the deployment has.
pub trait RouterCache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, SelectorError>;
}

fn cache_key(router_id: &str) -> String {
    format!("r:{router_id}")
}

/// Cache-lookup stage.  Misses select nothing; the composite moves on.
pub struct CacheSelector {
    cache: std::sync::Arc<dyn RouterCache>,
}

impl CacheSelector {
    pub fn new(cache: std::sync::Arc<dyn RouterCache>) -> Self {
        CacheSelector { cache }
    }
}

impl Selector for CacheSelector {
    fn select(&self, router_id: &str) -> Result<Option<String>, SelectorError> {
        self.cache.get(&cache_key(router_id))
    }

    fn update(&self, _instances: &[InstanceInfo]) {}
}

/// Weighted-random stage over prefix-sum weights.
#[derive(Default)]
pub struct WeightSelector {
    state: RwLock<WeightState>,
}

#[derive(Default)]
struct WeightState {
    ids: Vec<String>,
    prefix: Vec<u64>,
}

impl WeightSelector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Selector for WeightSelector {
    fn select(&self, _router_id: &str) -> Result<Option<String>, SelectorError> {
        let state = self.state.read().expect("weight selector lock");
        if state.ids.is_empty() {
            return Err(SelectorError::EmptyInstances);
        }
        if state.ids.len() == 1 {
            return Ok(Some(state.ids[0].clone()));
        }
        let total = *state.prefix.last().expect("non-empty prefix sums");
        if total == 0 {
            return Ok(None);
        }
        let r = rand::thread_rng().gen_range(1..=total);
        let i = state.prefix.partition_point(|&cum| cum < r);
        Ok(Some(state.ids[i].clone()))
    }

    fn update(&self, instances: &[InstanceInfo]) {
        let mut ids = Vec::with_capacity(instances.len());
        let mut prefix = Vec::with_capacity(instances.len());
        let mut sum = 0u64;
        for inst in instances {
            sum += u64::from(inst.weight);
            ids.push(inst.instance_id().to_owned());
            prefix.push(sum);
        }
        let mut state = self.state.write().expect("weight selector lock");
        state.ids = ids;
        state.prefix = prefix;
    }
}

/// Tries each stage in order; the first non-empty pick wins.  A stage
/// error is logged and skipped.  With an empty snapshot the composite
/// itself reports `EmptyInstances`.
pub struct CompositeSelector {
    stages: Vec<Box<dyn Selector>>,
    instance_count: AtomicUsize,
}

impl CompositeSelector {
    pub fn new(stages: Vec<Box<dyn Selector>>) -> Self {
        CompositeSelector {
            stages,
            instance_count: AtomicUsize::new(0),
        }
    }
}

impl Selector for CompositeSelector {
    fn select(&self, router_id: &str) -> Result<Option<String>, SelectorError> {
        if self.instance_count.load(Ordering::Acquire) == 0 {
            return Err(SelectorError::EmptyInstances);
        }
        for stage in &self.stages {
            match stage.select(router_id) {
                Ok(Some(id)) if !id.is_empty() => return Ok(Some(id)),
                Ok(_) => {}
                Err(e) => {
                    error!(router_id, error = %e, "selector stage failed, trying next");
                }
            }
        }
        Ok(None)
    }

    fn update(&self, instances: &[InstanceInfo]) {
        self.instance_count.store(instances.len(), Ordering::Release);
        for stage in &self.stages {
            stage.update(instances);
        }
    }
}
