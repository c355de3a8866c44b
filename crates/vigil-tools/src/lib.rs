//! Built-in tool adapters for the vigil platform.
//!
//! Each adapter fronts one external scanner with the uniform
//! `describe / validate / execute / parse` contract from `vigil-core`.
//! Registration is explicit: hosts call [`register_builtins`] at startup.

pub mod semgrep;
pub mod syft;
pub mod trivy;
pub mod zap;

use std::sync::Arc;
use vigil_core::adapter::base::ToolAdapter;
use vigil_core::adapter::registry::ToolRegistry;
use vigil_core::VigilResult;

pub use semgrep::SemgrepAdapter;
pub use syft::SyftAdapter;
pub use trivy::TrivyAdapter;
pub use zap::ZapAdapter;

/// All built-in adapters.
pub fn builtin_adapters() -> Vec<Arc<dyn ToolAdapter>> {
    vec![
        Arc::new(SemgrepAdapter::new()),
        Arc::new(TrivyAdapter::new()),
        Arc::new(SyftAdapter::new()),
        Arc::new(ZapAdapter::new()),
    ]
}

/// Register every built-in adapter on a registry.
pub fn register_builtins(registry: &ToolRegistry) -> VigilResult<()> {
    for adapter in builtin_adapters() {
        registry.register(adapter)?;
    }
    Ok(())
}
