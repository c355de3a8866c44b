//! Broker session: state machine and method dispatch.
//!
//! One session serves one connected client. The session enforces the
//! lifecycle `Uninitialized → Initialized → Serving → Closing → Closed`,
//! bounds concurrent `tools/call` invocations, and keeps completed scan
//! responses addressable as `scan://` resources.

use crate::protocol::{methods, RpcError, RpcRequest, RpcResponse, PROTOCOL_VERSION};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use vigil_core::adapter::base::ExecutionContext;
use vigil_core::adapter::registry::ToolRegistry;
use vigil_core::schema::capability::ToolCapability;
use vigil_core::schema::request::{ScanLimits, ScanOptions, ScanRequest, ScanTarget, TargetKind};

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initialized,
    Serving,
    Closing,
    Closed,
}

/// What to do with `tools/call` overflow beyond the in-flight bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Wait for a slot.
    Queue,
    /// Reject with `-32004 Busy`.
    Reject,
}

/// Per-session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Concurrent `tools/call` bound; defaults to the scheduler's
    /// `max_parallel`.
    pub max_in_flight: usize,
    pub overflow: OverflowPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 4,
            overflow: OverflowPolicy::Queue,
        }
    }
}

struct StoredScan {
    tool_id: String,
    success: bool,
    scanned_at: chrono::DateTime<Utc>,
    response: Value,
}

/// One client session over the broker protocol.
pub struct BrokerSession {
    registry: Arc<ToolRegistry>,
    config: SessionConfig,
    state: Mutex<SessionState>,
    in_flight: Arc<Semaphore>,
    scans: DashMap<String, StoredScan>,
    scan_order: Mutex<Vec<String>>,
}

impl BrokerSession {
    pub fn new(registry: Arc<ToolRegistry>, config: SessionConfig) -> Self {
        let in_flight = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
        Self {
            registry,
            config,
            state: Mutex::new(SessionState::Uninitialized),
            in_flight,
            scans: DashMap::new(),
            scan_order: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Move to `Closing`: new requests are rejected, in-flight ones run to
    /// their own deadlines.
    pub fn begin_shutdown(&self) {
        let mut state = self.state.lock();
        if *state != SessionState::Closed {
            *state = SessionState::Closing;
        }
    }

    pub fn close(&self) {
        *self.state.lock() = SessionState::Closed;
    }

    /// Dispatch one request to a response.
    pub async fn handle_request(&self, request: RpcRequest) -> RpcResponse {
        let id = request.id.clone();
        let method = request.method.clone();
        debug!(method = %method, id = %id, "request received");

        match self.gate(&method) {
            Ok(()) => {}
            Err(error) => return RpcResponse::failure(id, error),
        }

        let params = request.params.unwrap_or(Value::Null);
        let result = match method.as_str() {
            methods::INITIALIZE => self.handle_initialize(params),
            methods::TOOLS_LIST => self.handle_tools_list(),
            methods::TOOLS_CALL => self.handle_tools_call(params).await,
            methods::RESOURCES_LIST => self.handle_resources_list(),
            methods::RESOURCES_READ => self.handle_resources_read(params),
            methods::SHUTDOWN => {
                self.begin_shutdown();
                Ok(json!({}))
            }
            other => Err(RpcError::method_not_found(other)),
        };

        match result {
            Ok(value) => RpcResponse::success(id, value),
            Err(error) => {
                warn!(method = %method, code = error.code, "request failed");
                RpcResponse::failure(id, error)
            }
        }
    }

    /// State-machine admission control.
    fn gate(&self, method: &str) -> Result<(), RpcError> {
        let mut state = self.state.lock();
        match *state {
            SessionState::Uninitialized => {
                if method == methods::INITIALIZE {
                    Ok(())
                } else {
                    Err(RpcError::not_initialized())
                }
            }
            SessionState::Initialized => {
                if method != methods::INITIALIZE {
                    *state = SessionState::Serving;
                }
                Ok(())
            }
            SessionState::Serving => Ok(()),
            SessionState::Closing | SessionState::Closed => Err(RpcError::shutting_down()),
        }
    }

    fn handle_initialize(&self, params: Value) -> Result<Value, RpcError> {
        let client_version = params
            .get("protocolVersion")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        info!(client_version, "session initialized");
        *self.state.lock() = SessionState::Initialized;
        Ok(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "serverInfo": {
                "name": "vigil-broker",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {
                "tools": {},
                "resources": {},
            },
        }))
    }

    fn handle_tools_list(&self) -> Result<Value, RpcError> {
        let tools: Vec<Value> = self
            .registry
            .list()
            .into_iter()
            .map(|cap| {
                json!({
                    "name": cap.tool_id,
                    "description": cap.description,
                    "inputSchema": input_schema(&cap),
                    "category": cap.category.to_string(),
                    "available": true,
                    "capability": cap,
                })
            })
            .collect();
        Ok(json!({ "tools": tools }))
    }

    async fn handle_tools_call(&self, params: Value) -> Result<Value, RpcError> {
        let name = params
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RpcError::invalid_params("missing tool name"))?
            .to_string();
        let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

        let permit = match self.config.overflow {
            OverflowPolicy::Queue => self
                .in_flight
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| RpcError::shutting_down())?,
            OverflowPolicy::Reject => self
                .in_flight
                .clone()
                .try_acquire_owned()
                .map_err(|_| RpcError::busy())?,
        };

        let guard = self
            .registry
            .acquire(&name)
            .ok_or_else(|| RpcError::tool_missing(&name))?;
        let capability = guard.capability().clone();
        let request = scan_request_from_arguments(&capability, &arguments)?;

        // Per-call ceiling: the smaller of the request limit and the
        // descriptor's own timeout.
        let ceiling = Duration::from_secs(
            request
                .limits
                .timeout_secs
                .min(capability.execution.default_timeout_secs),
        );
        let workdir = match request.target.kind {
            TargetKind::LocalPath => std::path::PathBuf::from(&request.target.location),
            _ => std::env::temp_dir(),
        };
        let ctx = ExecutionContext::new(ceiling, workdir)
            .with_network_allowed(request.network_allowed);

        let started = Instant::now();
        let run = guard.adapter().run(&request, &ctx).await;
        drop(permit);

        let response = match run {
            Ok(outcome) => {
                let response = json!({
                    "success": true,
                    "tool_name": capability.tool_name,
                    "execution_time_seconds": started.elapsed().as_secs_f64(),
                    "vulnerabilities_count": outcome.findings.len(),
                    "findings": outcome.findings,
                    "diagnostics": outcome.diagnostics,
                });
                self.store_scan(&request.scan_id, &name, true, response.clone());
                response
            }
            Err(failure) => {
                let response = json!({
                    "success": false,
                    "tool_name": capability.tool_name,
                    "execution_time_seconds": started.elapsed().as_secs_f64(),
                    "vulnerabilities_count": failure.partial_findings.len(),
                    "findings": failure.partial_findings,
                    "diagnostics": failure.diagnostics,
                    "error": {
                        "kind": failure.error.kind(),
                        "message": failure.error.to_string(),
                    },
                });
                self.store_scan(&request.scan_id, &name, false, response.clone());
                return Err(
                    RpcError::from_adapter_error(&failure.error).with_data(response)
                );
            }
        };

        let text = serde_json::to_string(&response)
            .map_err(|e| RpcError::internal_error(e.to_string()))?;
        Ok(json!({
            "content": [{ "type": "text", "text": text }],
        }))
    }

    fn handle_resources_list(&self) -> Result<Value, RpcError> {
        let mut resources = vec![json!({
            "uri": "scan://history",
            "name": "Scan history",
            "description": "All scans executed in this session",
        })];
        for scan_id in self.scan_order.lock().iter() {
            if let Some(scan) = self.scans.get(scan_id) {
                resources.push(json!({
                    "uri": format!("scan://results/{scan_id}"),
                    "name": format!("Scan {scan_id}"),
                    "description": format!("{} scan at {}", scan.tool_id, scan.scanned_at),
                }));
            }
        }
        Ok(json!({ "resources": resources }))
    }

    fn handle_resources_read(&self, params: Value) -> Result<Value, RpcError> {
        let uri = params
            .get("uri")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RpcError::invalid_params("missing uri"))?;

        let text = if uri == "scan://history" {
            let history: Vec<Value> = self
                .scan_order
                .lock()
                .iter()
                .filter_map(|scan_id| {
                    self.scans.get(scan_id).map(|scan| {
                        json!({
                            "scan_id": scan_id,
                            "tool": scan.tool_id,
                            "success": scan.success,
                            "scanned_at": scan.scanned_at.to_rfc3339(),
                        })
                    })
                })
                .collect();
            serde_json::to_string(&json!({ "history": history }))
                .map_err(|e| RpcError::internal_error(e.to_string()))?
        } else if let Some(scan_id) = uri.strip_prefix("scan://results/") {
            let scan = self
                .scans
                .get(scan_id)
                .ok_or_else(|| RpcError::invalid_params(format!("unknown scan: {scan_id}")))?;
            serde_json::to_string(&scan.response)
                .map_err(|e| RpcError::internal_error(e.to_string()))?
        } else {
            return Err(RpcError::invalid_params(format!("unsupported uri: {uri}")));
        };

        Ok(json!({
            "contents": [{
                "uri": uri,
                "mimeType": "application/json",
                "text": text,
            }],
        }))
    }

    fn store_scan(&self, scan_id: &str, tool_id: &str, success: bool, response: Value) {
        if self.scans.contains_key(scan_id) {
            self.scans.insert(
                scan_id.to_string(),
                StoredScan {
                    tool_id: tool_id.to_string(),
                    success,
                    scanned_at: Utc::now(),
                    response,
                },
            );
            return;
        }
        self.scan_order.lock().push(scan_id.to_string());
        self.scans.insert(
            scan_id.to_string(),
            StoredScan {
                tool_id: tool_id.to_string(),
                success,
                scanned_at: Utc::now(),
                response,
            },
        );
    }
}

/// Build a `ScanRequest` from `tools/call` arguments.
fn scan_request_from_arguments(
    capability: &ToolCapability,
    arguments: &Value,
) -> Result<ScanRequest, RpcError> {
    let target = if let Some(target) = arguments.get("target") {
        serde_json::from_value::<ScanTarget>(target.clone())
            .map_err(|e| RpcError::invalid_scan_input(format!("target: {e}")))?
    } else if let Some(path) = arguments.get("target_path").and_then(|v| v.as_str()) {
        ScanTarget::local_path(path)
    } else if let Some(url) = arguments.get("target_url").and_then(|v| v.as_str()) {
        ScanTarget::http_url(url)
    } else if let Some(image) = arguments.get("target_image").and_then(|v| v.as_str()) {
        ScanTarget::container_image(image)
    } else {
        return Err(RpcError::invalid_scan_input(
            "one of target, target_path, target_url, target_image is required",
        ));
    };

    let mut options = ScanOptions::default();
    if let Some(rules) = arguments.get("rules").and_then(|v| v.as_str()) {
        options.rules = Some(rules.to_string());
    }
    if let Some(excludes) = arguments.get("exclude_paths").and_then(|v| v.as_array()) {
        options.exclude_paths = excludes
            .iter()
            .filter_map(|v| v.as_str())
            .map(String::from)
            .collect();
    }
    if let Some(language) = arguments.get("language").and_then(|v| v.as_str()) {
        options.language = Some(language.to_string());
    }

    let mut limits = ScanLimits::default();
    if let Some(timeout) = arguments.get("timeout_secs").and_then(|v| v.as_u64()) {
        if timeout == 0 {
            return Err(RpcError::invalid_scan_input("timeout_secs must be positive"));
        }
        limits.timeout_secs = timeout;
    }

    let mut request = ScanRequest::new(target)
        .with_options(options)
        .with_limits(limits)
        .with_network_allowed(
            arguments
                .get("network_allowed")
                .and_then(|v| v.as_bool())
                .unwrap_or(capability.execution.requires_network),
        );
    if let Some(scan_id) = arguments.get("scan_id").and_then(|v| v.as_str()) {
        request = request.with_scan_id(scan_id);
    }
    Ok(request)
}

/// Argument schema advertised through `tools/list`, shaped by the
/// descriptor's accepted target kinds.
fn input_schema(capability: &ToolCapability) -> Value {
    let mut properties = serde_json::Map::new();
    let targets = &capability.input_requirements.accepted_targets;
    if targets.contains(&TargetKind::LocalPath) {
        properties.insert(
            "target_path".into(),
            json!({"type": "string", "description": "Filesystem path to scan"}),
        );
    }
    if targets.contains(&TargetKind::HttpUrl) {
        properties.insert(
            "target_url".into(),
            json!({"type": "string", "description": "Base URL of the running application"}),
        );
    }
    if targets.contains(&TargetKind::ContainerImage) {
        properties.insert(
            "target_image".into(),
            json!({"type": "string", "description": "Container image reference"}),
        );
    }
    properties.insert(
        "scan_id".into(),
        json!({"type": "string", "description": "Stable id for tracking this scan"}),
    );
    properties.insert(
        "rules".into(),
        json!({"type": "string", "description": "Tool-specific rule set reference"}),
    );
    properties.insert(
        "timeout_secs".into(),
        json!({"type": "integer", "description": "Per-call timeout ceiling in seconds"}),
    );
    properties.insert(
        "network_allowed".into(),
        json!({"type": "boolean", "description": "Permit outbound network access"}),
    );
    json!({
        "type": "object",
        "properties": properties,
    })
}
