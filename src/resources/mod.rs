// src/resources/mod.rs

//! Resource manager: shared, lazily created instances (database pools,
//! clients, ...) scoped to a single run.
//!
//! A mode bundles the factories a run may use. Each resource key gets at
//! most one instance per run, reference-counted across every step that
//! declares it and torn down exactly once.

mod manager;

pub use manager::{ResourceInitFailure, ResourceManager, TeardownFailure};

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

/// Opaque resource instance. Compute code downcasts it via [`Resources::get`].
pub type ResourceHandle = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ResourceInitContext {
    pub run_id: Uuid,
    pub key: String,
}

#[async_trait]
pub trait ResourceFactory: Send + Sync {
    async fn init(&self, ctx: ResourceInitContext) -> Result<ResourceHandle, String>;

    async fn teardown(&self, _handle: ResourceHandle) -> Result<(), String> {
        Ok(())
    }
}

/// Named bundle of resource factories available to a run.
#[derive(Clone)]
pub struct ModeDefinition {
    name: String,
    resources: BTreeMap<String, Arc<dyn ResourceFactory>>,
}

impl fmt::Debug for ModeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModeDefinition")
            .field("name", &self.name)
            .field("resources", &self.resources.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ModeDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resources: BTreeMap::new(),
        }
    }

    pub fn resource(mut self, key: impl Into<String>, factory: impl ResourceFactory + 'static) -> Self {
        self.resources.insert(key.into(), Arc::new(factory));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resource_keys(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(|k| k.as_str())
    }

    pub fn has_resource(&self, key: &str) -> bool {
        self.resources.contains_key(key)
    }

    pub(crate) fn factory(&self, key: &str) -> Option<Arc<dyn ResourceFactory>> {
        self.resources.get(key).cloned()
    }
}

/// Resource instances handed to one step's compute.
#[derive(Clone, Default)]
pub struct Resources {
    handles: BTreeMap<String, ResourceHandle>,
}

impl fmt::Debug for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handles.keys()).finish()
    }
}

impl Resources {
    pub(crate) fn insert(&mut self, key: String, handle: ResourceHandle) {
        self.handles.insert(key, handle);
    }

    /// Typed access to a resource instance.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<&T> {
        self.handles.get(key).and_then(|h| (**h).downcast_ref::<T>())
    }

    pub fn handle(&self, key: &str) -> Option<ResourceHandle> {
        self.handles.get(key).cloned()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.handles.keys().map(|k| k.as_str())
    }
}
