//! Process-scope tool registry.
//!
//! Adapters are indexed by `tool_id`. Registration is idempotent for an
//! identical descriptor and rejects a conflicting duplicate; deregistration
//! is refused while executions are in flight, tracked by the RAII
//! [`AdapterGuard`]. There is no global instance: a registry handle is
//! constructed at startup and passed into components, and tests build a
//! fresh one each.

use crate::adapter::base::ToolAdapter;
use crate::error::{VigilError, VigilResult};
use crate::schema::capability::{ToolCapability, ToolCategory};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

struct RegisteredTool {
    adapter: Arc<dyn ToolAdapter>,
    capability: ToolCapability,
    in_flight: Arc<AtomicUsize>,
}

/// Concurrent registry of tool adapters.
#[derive(Default)]
pub struct ToolRegistry {
    tools: DashMap<String, RegisteredTool>,
}

/// RAII handle pinning an adapter while an execution is in flight.
///
/// Holding the guard blocks deregistration of the adapter's id; dropping
/// it releases the pin.
pub struct AdapterGuard {
    adapter: Arc<dyn ToolAdapter>,
    capability: ToolCapability,
    in_flight: Arc<AtomicUsize>,
}

impl AdapterGuard {
    pub fn adapter(&self) -> &Arc<dyn ToolAdapter> {
        &self.adapter
    }

    pub fn capability(&self) -> &ToolCapability {
        &self.capability
    }
}

impl Drop for AdapterGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its descriptor's `tool_id`.
    ///
    /// Re-registering the identical descriptor is a no-op; a different
    /// descriptor under an existing id is rejected.
    pub fn register(&self, adapter: Arc<dyn ToolAdapter>) -> VigilResult<()> {
        let capability = adapter.describe();
        capability.validate()?;
        let tool_id = capability.tool_id.clone();

        if let Some(existing) = self.tools.get(&tool_id) {
            if existing.capability == capability {
                return Ok(());
            }
            return Err(VigilError::Registry(format!(
                "tool id already registered with a different descriptor: {tool_id}"
            )));
        }

        info!(tool_id = %tool_id, category = %capability.category, "registered adapter");
        self.tools.insert(
            tool_id,
            RegisteredTool {
                adapter,
                capability,
                in_flight: Arc::new(AtomicUsize::new(0)),
            },
        );
        Ok(())
    }

    /// Remove an adapter. Fails while any execution holds a guard.
    pub fn deregister(&self, tool_id: &str) -> VigilResult<()> {
        let Some(entry) = self.tools.get(tool_id) else {
            return Err(VigilError::Registry(format!("tool not registered: {tool_id}")));
        };
        if entry.in_flight.load(Ordering::SeqCst) > 0 {
            warn!(tool_id = %tool_id, "deregistration refused: executions in flight");
            return Err(VigilError::Registry(format!(
                "tool has in-flight executions: {tool_id}"
            )));
        }
        drop(entry);
        self.tools.remove(tool_id);
        info!(tool_id = %tool_id, "deregistered adapter");
        Ok(())
    }

    /// Acquire an adapter for execution, pinning it against deregistration.
    pub fn acquire(&self, tool_id: &str) -> Option<AdapterGuard> {
        let entry = self.tools.get(tool_id)?;
        entry.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(AdapterGuard {
            adapter: Arc::clone(&entry.adapter),
            capability: entry.capability.clone(),
            in_flight: Arc::clone(&entry.in_flight),
        })
    }

    /// Look up a capability without pinning.
    pub fn capability(&self, tool_id: &str) -> Option<ToolCapability> {
        self.tools.get(tool_id).map(|t| t.capability.clone())
    }

    pub fn contains(&self, tool_id: &str) -> bool {
        self.tools.contains_key(tool_id)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// All registered tool ids, sorted for deterministic iteration.
    pub fn tool_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.tools.iter().map(|t| t.key().clone()).collect();
        ids.sort();
        ids
    }

    /// All capability declarations, sorted by tool id.
    pub fn list(&self) -> Vec<ToolCapability> {
        let mut caps: Vec<_> = self.tools.iter().map(|t| t.capability.clone()).collect();
        caps.sort_by(|a, b| a.tool_id.cmp(&b.tool_id));
        caps
    }

    /// Discover tools by analysis category.
    pub fn discover_by_category(&self, category: ToolCategory) -> Vec<ToolCapability> {
        self.list()
            .into_iter()
            .filter(|cap| cap.category == category)
            .collect()
    }

    /// Discover tools supporting a language.
    pub fn discover_by_language(&self, language: &str) -> Vec<ToolCapability> {
        self.list()
            .into_iter()
            .filter(|cap| cap.supports_language(language))
            .collect()
    }

    /// Discover tools able to detect a vulnerability class.
    pub fn discover_by_detection_type(&self, detection_type: &str) -> Vec<ToolCapability> {
        self.list()
            .into_iter()
            .filter(|cap| cap.detects(detection_type))
            .collect()
    }
}
