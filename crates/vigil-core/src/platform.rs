//! Process-scope platform handle.
//!
//! There are no global singletons: a [`Platform`] is constructed once at
//! startup, wires the registry, store, event hub and engine together, and
//! is passed into whatever hosts them (the broker, an API façade, tests).
//! Tests build a fresh platform each.

use crate::adapter::base::ToolAdapter;
use crate::adapter::registry::ToolRegistry;
use crate::config::WorkflowConfig;
use crate::error::VigilResult;
use crate::workflow::engine::WorkflowEngine;
use crate::workflow::events::EventHub;
use crate::workflow::storage::{MemoryStore, WorkflowStore};
use std::sync::Arc;

/// Shared handles for one platform instance.
pub struct Platform {
    registry: Arc<ToolRegistry>,
    store: Arc<dyn WorkflowStore>,
    events: Arc<EventHub>,
    engine: Arc<WorkflowEngine>,
    config: WorkflowConfig,
}

impl Platform {
    pub fn builder() -> PlatformBuilder {
        PlatformBuilder::default()
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Register an adapter on this platform's registry.
    pub fn register_adapter(&self, adapter: Arc<dyn ToolAdapter>) -> VigilResult<()> {
        self.registry.register(adapter)
    }
}

/// Builder for a [`Platform`].
#[derive(Default)]
pub struct PlatformBuilder {
    config: Option<WorkflowConfig>,
    store: Option<Arc<dyn WorkflowStore>>,
    adapters: Vec<Arc<dyn ToolAdapter>>,
}

impl PlatformBuilder {
    pub fn with_config(mut self, config: WorkflowConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn WorkflowStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn ToolAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    pub fn build(self) -> VigilResult<Platform> {
        let config = self.config.unwrap_or_default();
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new(config.checkpoint.retention_count)));
        let registry = Arc::new(ToolRegistry::new());
        for adapter in self.adapters {
            registry.register(adapter)?;
        }
        let events = Arc::new(EventHub::default());
        let engine = Arc::new(WorkflowEngine::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&events),
            config.clone(),
        ));
        Ok(Platform {
            registry,
            store,
            events,
            engine,
            config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_platform_builds() {
        let platform = Platform::builder().build().unwrap();
        assert!(platform.registry().is_empty());
        assert_eq!(platform.config().concurrency.max_parallel_tools, 4);
    }
}
