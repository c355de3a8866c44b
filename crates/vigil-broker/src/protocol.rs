//! JSON-RPC 2.0 message types for the broker wire protocol.
//!
//! One JSON object per line (UTF-8, LF). Requests carry an `id`;
//! notifications omit it; responses echo the request `id` with either
//! `result` or `error`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use vigil_core::error::AdapterError;

/// Protocol version exchanged during `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC version string.
pub const JSONRPC_VERSION: &str = "2.0";

/// Any wire message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcMessage {
    Request(RpcRequest),
    Response(RpcResponse),
    Notification(RpcNotification),
}

impl RpcMessage {
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request(req) => Some(&req.id),
            Self::Response(res) => Some(&res.id),
            Self::Notification(_) => None,
        }
    }
}

/// Request id: string or number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Number(i64),
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

/// JSON-RPC request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params: None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }
}

/// JSON-RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: impl Into<RequestId>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: impl Into<RequestId>, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            result: None,
            error: Some(error),
        }
    }

    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// JSON-RPC notification (no id, no reply).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcNotification {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params: None,
        }
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    // Standard codes.

    pub fn parse_error() -> Self {
        Self::new(-32700, "Parse error")
    }

    pub fn invalid_request() -> Self {
        Self::new(-32600, "Invalid request")
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(-32601, format!("Method not found: {method}"))
    }

    pub fn invalid_params(detail: impl Into<String>) -> Self {
        Self::new(-32602, format!("Invalid params: {}", detail.into()))
    }

    pub fn internal_error(detail: impl Into<String>) -> Self {
        Self::new(-32603, format!("Internal error: {}", detail.into()))
    }

    // Extension codes in the -32000..-32099 range.

    pub fn tool_missing(tool: &str) -> Self {
        Self::new(-32001, format!("Tool not available: {tool}"))
    }

    pub fn not_initialized() -> Self {
        Self::new(-32002, "Session not initialized")
    }

    pub fn shutting_down() -> Self {
        Self::new(-32003, "Shutting down")
    }

    pub fn busy() -> Self {
        Self::new(-32004, "Busy: too many calls in flight")
    }

    pub fn invalid_scan_input(detail: impl Into<String>) -> Self {
        Self::new(-32010, format!("Invalid scan input: {}", detail.into()))
    }

    pub fn execution_failed(detail: impl Into<String>) -> Self {
        Self::new(-32011, format!("Execution failed: {}", detail.into()))
    }

    pub fn timeout() -> Self {
        Self::new(-32012, "Tool execution timed out")
    }

    pub fn tool_parse_error(detail: impl Into<String>) -> Self {
        Self::new(-32013, format!("Output parse error: {}", detail.into()))
    }

    /// Map the adapter failure taxonomy onto extension codes.
    pub fn from_adapter_error(error: &AdapterError) -> Self {
        match error {
            AdapterError::ToolMissing { tool_id } => Self::tool_missing(tool_id),
            AdapterError::InvalidInput { reason, field_path } => {
                Self::invalid_scan_input(format!("{field_path}: {reason}"))
            }
            AdapterError::ExecutionFailed {
                exit_code,
                stderr_tail,
            } => Self::execution_failed(format!("exit {exit_code:?}: {stderr_tail}")),
            AdapterError::Timeout { .. } => Self::timeout(),
            AdapterError::ParseError(detail) => Self::tool_parse_error(detail.clone()),
            AdapterError::Canceled => Self::internal_error("canceled"),
        }
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

/// Method names the broker serves.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const SHUTDOWN: &str = "shutdown";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_shape() {
        let req = RpcRequest::new(1i64, methods::TOOLS_LIST);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"method\":\"tools/list\""));
        assert!(json.contains("\"id\":1"));
    }

    #[test]
    fn notification_has_no_id() {
        let json = serde_json::to_string(&RpcNotification::new(methods::INITIALIZED)).unwrap();
        assert!(!json.contains("\"id\""));
    }

    #[test]
    fn message_parse_discriminates() {
        let req: RpcMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#).unwrap();
        assert!(matches!(req, RpcMessage::Request(_)));

        let res: RpcMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}"#).unwrap();
        assert!(matches!(res, RpcMessage::Response(_)));

        let notif: RpcMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
                .unwrap();
        assert!(matches!(notif, RpcMessage::Notification(_)));
    }

    #[test]
    fn adapter_errors_map_to_extension_codes() {
        assert_eq!(
            RpcError::from_adapter_error(&AdapterError::tool_missing("semgrep")).code,
            -32001
        );
        assert_eq!(
            RpcError::from_adapter_error(&AdapterError::invalid_input("bad", "target")).code,
            -32010
        );
        assert_eq!(
            RpcError::from_adapter_error(&AdapterError::execution_failed(Some(2), "boom")).code,
            -32011
        );
        assert_eq!(
            RpcError::from_adapter_error(&AdapterError::Timeout { partial: None }).code,
            -32012
        );
        assert_eq!(
            RpcError::from_adapter_error(&AdapterError::ParseError("bad json".into())).code,
            -32013
        );
    }

    #[test]
    fn response_into_result() {
        let ok = RpcResponse::success(1i64, serde_json::json!({"ok": true}));
        assert_eq!(ok.into_result().unwrap()["ok"], true);

        let err = RpcResponse::failure(1i64, RpcError::busy());
        assert_eq!(err.into_result().unwrap_err().code, -32004);
    }
}
