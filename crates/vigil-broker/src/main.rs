//! Broker binary: serve the built-in adapters over stdio.

use anyhow::Result;
use std::sync::Arc;
use tracing::info;
use vigil_broker::session::{BrokerSession, SessionConfig};
use vigil_core::adapter::registry::ToolRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    // Protocol traffic owns stdout; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let registry = Arc::new(ToolRegistry::new());
    vigil_tools::register_builtins(&registry)?;
    info!(tools = registry.len(), "broker starting on stdio");

    let session = Arc::new(BrokerSession::new(registry, SessionConfig::default()));
    vigil_broker::server::serve(session, tokio::io::stdin(), tokio::io::stdout()).await?;
    Ok(())
}
