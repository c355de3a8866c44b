//! Full broker sessions driven over an in-memory duplex channel.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, WriteHalf};
use vigil_broker::protocol::{RpcRequest, RpcResponse};
use vigil_broker::session::{BrokerSession, OverflowPolicy, SessionConfig};
use vigil_core::adapter::base::{ExecutionContext, NativeOutput, ToolAdapter};
use vigil_core::adapter::registry::ToolRegistry;
use vigil_core::error::AdapterError;
use vigil_core::schema::capability::{
    Capabilities, ExecutionConfig, InputRequirements, OutputFormat, ToolCapability, ToolCategory,
    ToolMetadata,
};
use vigil_core::schema::finding::{
    derive_finding_id, Confidence, Description, Exploitability, Finding, FindingMetadata,
    Location, Severity, SeverityLevel, SourceTool, VerificationStatus, VulnerabilityType,
};
use vigil_core::schema::request::{ScanRequest, TargetKind};

struct EchoScanner {
    delay: Duration,
}

#[async_trait]
impl ToolAdapter for EchoScanner {
    fn describe(&self) -> ToolCapability {
        ToolCapability {
            tool_id: "echo-scanner".into(),
            tool_name: "Echo Scanner".into(),
            tool_version: "1.0".into(),
            category: ToolCategory::Sast,
            vendor: "test".into(),
            description: "reports one synthetic finding".into(),
            capabilities: Capabilities::default(),
            input_requirements: InputRequirements {
                accepted_targets: BTreeSet::from([TargetKind::LocalPath]),
                ..InputRequirements::default()
            },
            output_format: OutputFormat::default(),
            execution: ExecutionConfig::default(),
            metadata: ToolMetadata::default(),
        }
    }

    fn validate(&self, _request: &ScanRequest) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn execute(
        &self,
        _request: &ScanRequest,
        _ctx: &ExecutionContext,
    ) -> Result<NativeOutput, AdapterError> {
        tokio::time::sleep(self.delay).await;
        Ok(NativeOutput::complete(json!({"hits": 1})))
    }

    fn parse(
        &self,
        _output: &NativeOutput,
        request: &ScanRequest,
    ) -> Result<Vec<Finding>, AdapterError> {
        Ok(vec![Finding {
            finding_id: derive_finding_id("echo-scanner", "echo-rule", "main.rs", Some(1), None),
            scan_session_id: request.scan_id.clone(),
            vulnerability_type: VulnerabilityType {
                name: "echo finding".into(),
                cwe_id: Some(79),
                owasp_category: None,
            },
            location: Location {
                file_path: "main.rs".into(),
                line_start: Some(1),
                ..Location::default()
            },
            severity: Severity {
                level: SeverityLevel::High,
                cvss_score: Some(7.5),
                exploitability: Exploitability::Unknown,
            },
            confidence: Confidence::new(90, "synthetic"),
            source_tools: vec![SourceTool {
                tool_id: "echo-scanner".into(),
                rule_id: "echo-rule".into(),
                native_severity: "high".into(),
                raw_output: json!({"hits": 1}),
            }],
            description: Description {
                summary: "echo".into(),
                ..Description::default()
            },
            metadata: FindingMetadata::default(),
            verification_status: VerificationStatus::Pending,
        }])
    }
}

struct TestClient {
    writer: WriteHalf<DuplexStream>,
    reader: BufReader<tokio::io::ReadHalf<DuplexStream>>,
    next_id: i64,
}

impl TestClient {
    fn start(config: SessionConfig, delay: Duration) -> (Self, Arc<BrokerSession>) {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(EchoScanner { delay })).unwrap();
        let session = Arc::new(BrokerSession::new(registry, config));

        let (client_side, server_side) = tokio::io::duplex(64 * 1024);
        let (server_reader, server_writer) = tokio::io::split(server_side);
        let (client_reader, client_writer) = tokio::io::split(client_side);

        let serve_session = Arc::clone(&session);
        tokio::spawn(async move {
            let _ = vigil_broker::server::serve(serve_session, server_reader, server_writer).await;
        });

        (
            Self {
                writer: client_writer,
                reader: BufReader::new(client_reader),
                next_id: 0,
            },
            session,
        )
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn read_response(&mut self) -> RpcResponse {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(line.trim()).unwrap()
    }

    async fn call(&mut self, method: &str, params: Value) -> RpcResponse {
        self.next_id += 1;
        let request = RpcRequest::new(self.next_id, method).with_params(params);
        self.send_raw(&serde_json::to_string(&request).unwrap()).await;
        self.read_response().await
    }

    async fn initialize(&mut self) {
        let response = self
            .call(
                "initialize",
                json!({"protocolVersion": "2024-11-05", "capabilities": {}, "clientInfo": {}}),
            )
            .await;
        let result = response.into_result().unwrap();
        assert_eq!(result["serverInfo"]["name"], "vigil-broker");
    }
}

fn scan_dir() -> tempfile::TempDir {
    tempfile::tempdir().unwrap()
}

#[tokio::test]
async fn calls_before_initialize_are_rejected() {
    let (mut client, _session) = TestClient::start(SessionConfig::default(), Duration::ZERO);
    let response = client.call("tools/list", json!({})).await;
    assert_eq!(response.into_result().unwrap_err().code, -32002);
}

#[tokio::test]
async fn initialize_then_list_then_call_then_read_results() {
    let (mut client, _session) = TestClient::start(SessionConfig::default(), Duration::ZERO);
    client.initialize().await;

    let tools = client
        .call("tools/list", json!({}))
        .await
        .into_result()
        .unwrap();
    let tools = tools["tools"].as_array().unwrap().clone();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0]["name"], "echo-scanner");
    assert_eq!(tools[0]["category"], "SAST");
    assert!(tools[0]["inputSchema"]["properties"]["target_path"].is_object());

    let dir = scan_dir();
    let response = client
        .call(
            "tools/call",
            json!({
                "name": "echo-scanner",
                "arguments": {
                    "target_path": dir.path().to_string_lossy(),
                    "scan_id": "scan-42",
                },
            }),
        )
        .await
        .into_result()
        .unwrap();

    let text = response["content"][0]["text"].as_str().unwrap();
    let payload: Value = serde_json::from_str(text).unwrap();
    assert_eq!(payload["success"], true);
    assert_eq!(payload["tool_name"], "Echo Scanner");
    assert_eq!(payload["vulnerabilities_count"], 1);
    assert_eq!(payload["findings"][0]["severity"]["level"], "HIGH");

    let resources = client
        .call("resources/list", json!({}))
        .await
        .into_result()
        .unwrap();
    let uris: Vec<_> = resources["resources"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["uri"].as_str().unwrap().to_string())
        .collect();
    assert!(uris.contains(&"scan://history".to_string()));
    assert!(uris.contains(&"scan://results/scan-42".to_string()));

    let read = client
        .call("resources/read", json!({"uri": "scan://results/scan-42"}))
        .await
        .into_result()
        .unwrap();
    let stored: Value =
        serde_json::from_str(read["contents"][0]["text"].as_str().unwrap()).unwrap();
    assert_eq!(stored["success"], true);

    let history = client
        .call("resources/read", json!({"uri": "scan://history"}))
        .await
        .into_result()
        .unwrap();
    let history: Value =
        serde_json::from_str(history["contents"][0]["text"].as_str().unwrap()).unwrap();
    assert_eq!(history["history"][0]["scan_id"], "scan-42");
    assert_eq!(history["history"][0]["tool"], "echo-scanner");
}

#[tokio::test]
async fn unknown_tool_returns_tool_missing_code() {
    let (mut client, _session) = TestClient::start(SessionConfig::default(), Duration::ZERO);
    client.initialize().await;

    let response = client
        .call(
            "tools/call",
            json!({"name": "nonexistent", "arguments": {"target_path": "/tmp"}}),
        )
        .await;
    assert_eq!(response.into_result().unwrap_err().code, -32001);
}

#[tokio::test]
async fn missing_target_is_invalid_scan_input() {
    let (mut client, _session) = TestClient::start(SessionConfig::default(), Duration::ZERO);
    client.initialize().await;

    let response = client
        .call("tools/call", json!({"name": "echo-scanner", "arguments": {}}))
        .await;
    assert_eq!(response.into_result().unwrap_err().code, -32010);
}

#[tokio::test]
async fn shutdown_rejects_new_requests() {
    let (mut client, _session) = TestClient::start(SessionConfig::default(), Duration::ZERO);
    client.initialize().await;

    client
        .call("shutdown", json!({}))
        .await
        .into_result()
        .unwrap();

    let response = client.call("tools/list", json!({})).await;
    assert_eq!(response.into_result().unwrap_err().code, -32003);
}

#[tokio::test]
async fn overflow_reject_returns_busy() {
    let config = SessionConfig {
        max_in_flight: 1,
        overflow: OverflowPolicy::Reject,
    };
    let (mut client, _session) = TestClient::start(config, Duration::from_millis(400));
    client.initialize().await;

    let dir = scan_dir();
    let path = dir.path().to_string_lossy().to_string();

    // Fire two calls back to back without waiting for the first reply.
    let first = RpcRequest::new(100i64, "tools/call").with_params(json!({
        "name": "echo-scanner",
        "arguments": {"target_path": path, "scan_id": "s-1"},
    }));
    let second = RpcRequest::new(101i64, "tools/call").with_params(json!({
        "name": "echo-scanner",
        "arguments": {"target_path": path, "scan_id": "s-2"},
    }));
    client
        .send_raw(&serde_json::to_string(&first).unwrap())
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    client
        .send_raw(&serde_json::to_string(&second).unwrap())
        .await;

    let mut codes = Vec::new();
    for _ in 0..2 {
        let response = client.read_response().await;
        match response.into_result() {
            Ok(_) => codes.push(0),
            Err(error) => codes.push(error.code),
        }
    }
    codes.sort();
    assert_eq!(codes, vec![-32004, 0], "one success, one busy rejection");
}

#[tokio::test]
async fn parse_errors_get_null_id_response() {
    let (mut client, _session) = TestClient::start(SessionConfig::default(), Duration::ZERO);
    client.send_raw("this is not json").await;

    let mut line = String::new();
    client.reader.read_line(&mut line).await.unwrap();
    let value: Value = serde_json::from_str(line.trim()).unwrap();
    assert!(value["id"].is_null());
    assert_eq!(value["error"]["code"], -32700);
}
