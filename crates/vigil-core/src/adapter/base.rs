//! Base trait and run orchestration for tool adapters.

use crate::error::AdapterError;
use crate::schema::capability::ToolCapability;
use crate::schema::finding::Finding;
use crate::schema::request::{ScanRequest, TargetKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Stage markers emitted by `run` for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterStage {
    Validated,
    Executed,
    Parsed,
}

/// Event published as a run moves through its stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterEvent {
    pub tool_id: String,
    pub scan_id: String,
    pub stage: AdapterStage,
}

/// Structured diagnostics collected over one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    /// SHA-256 of the command line, so the exact invocation is auditable
    /// without logging secrets embedded in arguments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr_tail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    /// Normalization and execution notes, e.g. unmapped severity tokens.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl Diagnostics {
    pub fn note(&mut self, message: impl Into<String>) {
        self.notes.push(message.into());
    }
}

/// Raw output of one tool execution, preserved verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeOutput {
    pub payload: serde_json::Value,
    /// True when the payload was cut short by a deadline and the tool
    /// streams results; findings parsed from it are tagged `partial`.
    pub truncated: bool,
}

impl NativeOutput {
    pub fn complete(payload: serde_json::Value) -> Self {
        Self {
            payload,
            truncated: false,
        }
    }

    pub fn partial(payload: serde_json::Value) -> Self {
        Self {
            payload,
            truncated: true,
        }
    }
}

/// Everything an adapter needs from its caller to execute: budget, working
/// directory, network policy, cancellation and the stage-event sink.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub deadline: Duration,
    pub workdir: PathBuf,
    pub network_allowed: bool,
    pub cancel: CancellationToken,
    stage_tx: Option<mpsc::UnboundedSender<AdapterEvent>>,
}

impl ExecutionContext {
    pub fn new(deadline: Duration, workdir: impl Into<PathBuf>) -> Self {
        Self {
            deadline,
            workdir: workdir.into(),
            network_allowed: false,
            cancel: CancellationToken::new(),
            stage_tx: None,
        }
    }

    pub fn with_network_allowed(mut self, allowed: bool) -> Self {
        self.network_allowed = allowed;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_stage_sink(mut self, tx: mpsc::UnboundedSender<AdapterEvent>) -> Self {
        self.stage_tx = Some(tx);
        self
    }

    fn emit_stage(&self, tool_id: &str, scan_id: &str, stage: AdapterStage) {
        if let Some(tx) = &self.stage_tx {
            let _ = tx.send(AdapterEvent {
                tool_id: tool_id.to_string(),
                scan_id: scan_id.to_string(),
                stage,
            });
        }
    }
}

/// Successful result of a full `run`.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub findings: Vec<Finding>,
    pub diagnostics: Diagnostics,
}

/// Failed `run`, with whatever was salvaged before the failure.
#[derive(Debug, Clone)]
pub struct RunFailure {
    pub error: AdapterError,
    /// Findings parsed from partial output, each tagged `partial`.
    pub partial_findings: Vec<Finding>,
    pub diagnostics: Diagnostics,
}

impl RunFailure {
    fn bare(error: AdapterError, diagnostics: Diagnostics) -> Box<Self> {
        Box::new(Self {
            error,
            partial_findings: Vec::new(),
            diagnostics,
        })
    }
}

/// Contract every tool adapter implements.
///
/// Adapters hold no per-run state and never correlate across tools; both
/// belong to the aggregation layer.
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    /// The tool's capability declaration. Pure: same output on every call.
    fn describe(&self) -> ToolCapability;

    /// Reject requests the descriptor cannot satisfy, before any process
    /// is launched.
    fn validate(&self, request: &ScanRequest) -> Result<(), AdapterError>;

    /// Invoke the tool and return its native output.
    async fn execute(
        &self,
        request: &ScanRequest,
        ctx: &ExecutionContext,
    ) -> Result<NativeOutput, AdapterError>;

    /// Map native output to unified findings. Deterministic: identical
    /// input yields identical findings, ids included.
    fn parse(
        &self,
        output: &NativeOutput,
        request: &ScanRequest,
    ) -> Result<Vec<Finding>, AdapterError>;

    /// Full pipeline: validate, execute, parse, emitting one stage event
    /// per step. Provided by the framework; adapters rarely override it.
    async fn run(
        &self,
        request: &ScanRequest,
        ctx: &ExecutionContext,
    ) -> Result<RunOutcome, Box<RunFailure>> {
        let capability = self.describe();
        let tool_id = capability.tool_id.clone();
        let started = Instant::now();
        let mut diagnostics = Diagnostics::default();

        self.validate(request)
            .map_err(|e| RunFailure::bare(e, diagnostics.clone()))?;
        ctx.emit_stage(&tool_id, &request.scan_id, AdapterStage::Validated);
        debug!(tool_id = %tool_id, scan_id = %request.scan_id, "input validated");

        let output = match self.execute(request, ctx).await {
            Ok(output) => output,
            Err(AdapterError::Timeout { partial }) => {
                diagnostics.duration_secs = Some(started.elapsed().as_secs_f64());
                let partial_findings = partial
                    .as_deref()
                    .and_then(|text| serde_json::from_str(text).ok())
                    .map(NativeOutput::partial)
                    .and_then(|out| self.parse(&out, request).ok())
                    .map(|found| found.into_iter().map(Finding::mark_partial).collect())
                    .unwrap_or_default();
                warn!(tool_id = %tool_id, scan_id = %request.scan_id, "execution timed out");
                return Err(Box::new(RunFailure {
                    error: AdapterError::Timeout { partial },
                    partial_findings,
                    diagnostics,
                }));
            }
            Err(e) => {
                diagnostics.duration_secs = Some(started.elapsed().as_secs_f64());
                if let AdapterError::ExecutionFailed {
                    exit_code,
                    stderr_tail,
                } = &e
                {
                    diagnostics.exit_code = *exit_code;
                    diagnostics.stderr_tail = Some(stderr_tail.clone());
                }
                return Err(RunFailure::bare(e, diagnostics));
            }
        };
        ctx.emit_stage(&tool_id, &request.scan_id, AdapterStage::Executed);

        let findings = self
            .parse(&output, request)
            .map_err(|e| RunFailure::bare(e, diagnostics.clone()))?;
        ctx.emit_stage(&tool_id, &request.scan_id, AdapterStage::Parsed);

        // Normalization gaps surface as diagnostics, not silent defaults.
        for finding in &findings {
            if finding.confidence.reason.starts_with("severity unmapped") {
                diagnostics.note(finding.confidence.reason.clone());
            }
        }

        diagnostics.duration_secs = Some(started.elapsed().as_secs_f64());
        debug!(
            tool_id = %tool_id,
            scan_id = %request.scan_id,
            findings = findings.len(),
            "run complete"
        );
        Ok(RunOutcome {
            findings,
            diagnostics,
        })
    }
}

/// Shared validation of a request against a descriptor's input
/// requirements; adapters call this first and then add tool-specific
/// checks.
pub fn validate_against_descriptor(
    capability: &ToolCapability,
    request: &ScanRequest,
) -> Result<(), AdapterError> {
    let requirements = &capability.input_requirements;

    if !requirements.accepted_targets.contains(&request.target.kind) {
        return Err(AdapterError::invalid_input(
            format!(
                "tool {} does not accept {} targets",
                capability.tool_id, request.target.kind
            ),
            "target.kind",
        ));
    }

    if request.target.location.trim().is_empty() {
        return Err(AdapterError::invalid_input(
            "target location must not be empty",
            "target.location",
        ));
    }

    if capability.execution.requires_network && !request.network_allowed {
        return Err(AdapterError::invalid_input(
            format!("tool {} requires network access", capability.tool_id),
            "network_allowed",
        ));
    }

    if request.target.kind == TargetKind::LocalPath
        && !Path::new(&request.target.location).exists()
    {
        return Err(AdapterError::invalid_input(
            format!("target path does not exist: {}", request.target.location),
            "target.location",
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::capability::{
        Capabilities, ExecutionConfig, InputRequirements, OutputFormat, ToolCategory,
        ToolMetadata,
    };
    use crate::schema::request::ScanTarget;
    use std::collections::BTreeSet;

    fn capability() -> ToolCapability {
        ToolCapability {
            tool_id: "fake".into(),
            tool_name: "Fake".into(),
            tool_version: "1.0".into(),
            category: ToolCategory::Sast,
            vendor: "test".into(),
            description: "test adapter".into(),
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

    struct FakeAdapter {
        capability: ToolCapability,
        output: serde_json::Value,
    }

    #[async_trait]
    impl ToolAdapter for FakeAdapter {
        fn describe(&self) -> ToolCapability {
            self.capability.clone()
        }

        fn validate(&self, request: &ScanRequest) -> Result<(), AdapterError> {
            validate_against_descriptor(&self.capability, request)
        }

        async fn execute(
            &self,
            _request: &ScanRequest,
            _ctx: &ExecutionContext,
        ) -> Result<NativeOutput, AdapterError> {
            Ok(NativeOutput::complete(self.output.clone()))
        }

        fn parse(
            &self,
            _output: &NativeOutput,
            _request: &ScanRequest,
        ) -> Result<Vec<Finding>, AdapterError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn run_emits_three_stages() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = FakeAdapter {
            capability: capability(),
            output: serde_json::json!({"results": []}),
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = ExecutionContext::new(
            Duration::from_secs(10),
            dir.path(),
        )
        .with_stage_sink(tx);

        let request = ScanRequest::new(ScanTarget::local_path(
            dir.path().to_string_lossy().to_string(),
        ));
        adapter.run(&request, &ctx).await.unwrap();

        let stages: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.stage)
            .collect();
        assert_eq!(
            stages,
            vec![
                AdapterStage::Validated,
                AdapterStage::Executed,
                AdapterStage::Parsed
            ]
        );
    }

    #[tokio::test]
    async fn run_rejects_missing_path_before_execute() {
        let adapter = FakeAdapter {
            capability: capability(),
            output: serde_json::json!({}),
        };
        let ctx = ExecutionContext::new(Duration::from_secs(10), "/tmp");
        let request = ScanRequest::new(ScanTarget::local_path("/definitely/not/here"));

        let failure = adapter.run(&request, &ctx).await.unwrap_err();
        assert!(matches!(failure.error, AdapterError::InvalidInput { .. }));
    }

    #[test]
    fn descriptor_validation_rejects_wrong_target_kind() {
        let cap = capability();
        let request = ScanRequest::new(ScanTarget::http_url("http://example.test"));
        let err = validate_against_descriptor(&cap, &request).unwrap_err();
        assert!(matches!(err, AdapterError::InvalidInput { .. }));
    }

    #[test]
    fn descriptor_validation_enforces_network_policy() {
        let mut cap = capability();
        cap.execution.requires_network = true;
        let dir = tempfile::tempdir().unwrap();
        let request = ScanRequest::new(ScanTarget::local_path(
            dir.path().to_string_lossy().to_string(),
        ));
        assert!(validate_against_descriptor(&cap, &request).is_err());

        let allowed = request.with_network_allowed(true);
        assert!(validate_against_descriptor(&cap, &allowed).is_ok());
    }
}
