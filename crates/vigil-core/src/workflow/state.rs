//! Typed workflow state.
//!
//! One [`WorkflowState`] value is the complete, serializable description of
//! a workflow run: its plan, position, accumulated findings and timings.
//! Checkpoints are immutable snapshots of this value.

use crate::schema::finding::Finding;
use crate::schema::request::{ScanLimits, ScanOptions, ScanTarget};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle phase of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowPhase {
    Pending,
    Running,
    Paused,
    Succeeded,
    Failed,
    Canceled,
}

impl WorkflowPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
        };
        write!(f, "{s}")
    }
}

/// Scenario tag selecting a plan template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    CodeCommit,
    DependencyUpdate,
    EmergencyVuln,
    ReleaseRegression,
    Custom,
}

impl std::fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::CodeCommit => "code_commit",
            Self::DependencyUpdate => "dependency_update",
            Self::EmergencyVuln => "emergency_vuln",
            Self::ReleaseRegression => "release_regression",
            Self::Custom => "custom",
        };
        write!(f, "{s}")
    }
}

/// Kind of a plan node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Initialize,
    SingleScan,
    ParallelScan,
    ResultCollection,
    Validation,
    HumanReview,
    Retry,
    Finalize,
}

impl NodeKind {
    pub fn is_scan(&self) -> bool {
        matches!(self, Self::SingleScan | Self::ParallelScan)
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initialize => "initialize",
            Self::SingleScan => "single_scan",
            Self::ParallelScan => "parallel_scan",
            Self::ResultCollection => "result_collection",
            Self::Validation => "validation",
            Self::HumanReview => "human_review",
            Self::Retry => "retry",
            Self::Finalize => "finalize",
        };
        write!(f, "{s}")
    }
}

/// One entry of a plan. Node inputs are projections of the workflow state,
/// so the spec is just the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub kind: NodeKind,
}

impl NodeSpec {
    pub fn new(kind: NodeKind) -> Self {
        Self { kind }
    }
}

/// Outcome status of one node execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Succeeded,
    Failed,
    Paused,
    Canceled,
}

/// Execution record for one tool inside a scan node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRunRecord {
    pub tool_id: String,
    pub success: bool,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub finding_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of one node execution, kept in the state for observability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub kind: NodeKind,
    pub index: usize,
    pub status: NodeStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_runs: Vec<ToolRunRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Node-specific diagnostic payload.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub output: serde_json::Value,
}

/// Complete state of one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: String,
    pub workflow_type: WorkflowType,
    pub phase: WorkflowPhase,
    pub target: ScanTarget,
    /// Tools the plan operates on, in selection order.
    pub selected_tool_ids: Vec<String>,
    pub options: ScanOptions,
    pub limits: ScanLimits,
    pub network_allowed: bool,
    pub plan: Vec<NodeSpec>,
    /// Index of the next node to execute; `cursor == plan.len()` once the
    /// plan is exhausted.
    pub cursor: usize,
    pub node_results: Vec<NodeResult>,
    pub findings: Vec<Finding>,
    /// Free-form context, including the human-review annotation.
    #[serde(default)]
    pub context: BTreeMap<String, serde_json::Value>,
    /// Completion in [0.0, 1.0]; monotonic within one run.
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Monotonic checkpoint counter; incremented on every persisted
    /// transition.
    pub checkpoint_seq: u64,
}

impl WorkflowState {
    pub fn new(
        workflow_id: impl Into<String>,
        workflow_type: WorkflowType,
        target: ScanTarget,
        plan: Vec<NodeSpec>,
    ) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: workflow_id.into(),
            workflow_type,
            phase: WorkflowPhase::Pending,
            target,
            selected_tool_ids: Vec::new(),
            options: ScanOptions::default(),
            limits: ScanLimits::default(),
            network_allowed: false,
            plan,
            cursor: 0,
            node_results: Vec::new(),
            findings: Vec::new(),
            context: BTreeMap::new(),
            progress: 0.0,
            error: None,
            created_at: now,
            updated_at: now,
            checkpoint_seq: 0,
        }
    }

    /// The node the cursor points at, if the plan is not exhausted.
    pub fn current_node(&self) -> Option<NodeSpec> {
        self.plan.get(self.cursor).copied()
    }

    /// Advance past a completed node and recompute progress.
    pub fn advance_cursor(&mut self) {
        debug_assert!(self.cursor < self.plan.len());
        self.cursor += 1;
        self.progress = if self.plan.is_empty() {
            1.0
        } else {
            self.cursor as f64 / self.plan.len() as f64
        };
        self.updated_at = Utc::now();
    }

    pub fn record_node(&mut self, result: NodeResult) {
        if result.status == NodeStatus::Failed {
            if let Some(error) = &result.error {
                self.error = Some(error.clone());
            }
        }
        self.node_results.push(result);
        self.updated_at = Utc::now();
    }

    pub fn set_phase(&mut self, phase: WorkflowPhase) {
        self.phase = phase;
        self.updated_at = Utc::now();
    }

    /// The most recent scan node result, used by the `retry` node.
    pub fn last_scan_result(&self) -> Option<&NodeResult> {
        self.node_results.iter().rev().find(|r| r.kind.is_scan())
    }

    /// Compact summary for the status read API.
    pub fn summary(&self) -> WorkflowSummary {
        WorkflowSummary {
            workflow_id: self.workflow_id.clone(),
            workflow_type: self.workflow_type,
            phase: self.phase,
            progress: self.progress,
            cursor: self.cursor,
            plan_len: self.plan.len(),
            finding_count: self.findings.len(),
            error: self.error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            checkpoint_seq: self.checkpoint_seq,
        }
    }
}

/// Read-API projection of a workflow state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub workflow_id: String,
    pub workflow_type: WorkflowType,
    pub phase: WorkflowPhase,
    pub progress: f64,
    pub cursor: usize,
    pub plan_len: usize,
    pub finding_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub checkpoint_seq: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::request::ScanTarget;

    fn state() -> WorkflowState {
        WorkflowState::new(
            "wf-1",
            WorkflowType::CodeCommit,
            ScanTarget::local_path("/tmp/project"),
            vec![
                NodeSpec::new(NodeKind::Initialize),
                NodeSpec::new(NodeKind::SingleScan),
                NodeSpec::new(NodeKind::ResultCollection),
                NodeSpec::new(NodeKind::Finalize),
            ],
        )
    }

    #[test]
    fn cursor_advance_updates_progress() {
        let mut s = state();
        assert_eq!(s.progress, 0.0);
        s.advance_cursor();
        assert!((s.progress - 0.25).abs() < f64::EPSILON);
        s.advance_cursor();
        s.advance_cursor();
        s.advance_cursor();
        assert_eq!(s.cursor, s.plan.len());
        assert!((s.progress - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn state_roundtrips_through_json() {
        let mut s = state();
        s.advance_cursor();
        s.context
            .insert("note".into(), serde_json::json!({"reviewed": true}));
        let json = serde_json::to_string(&s).unwrap();
        let back: WorkflowState = serde_json::from_str(&json).unwrap();
        assert_eq!(s, back);
    }

    #[test]
    fn terminal_phases() {
        assert!(WorkflowPhase::Succeeded.is_terminal());
        assert!(WorkflowPhase::Failed.is_terminal());
        assert!(WorkflowPhase::Canceled.is_terminal());
        assert!(!WorkflowPhase::Paused.is_terminal());
        assert!(!WorkflowPhase::Running.is_terminal());
    }

    #[test]
    fn failed_node_records_error() {
        let mut s = state();
        let now = Utc::now();
        s.record_node(NodeResult {
            kind: NodeKind::SingleScan,
            index: 1,
            status: NodeStatus::Failed,
            started_at: now,
            finished_at: now,
            duration_secs: 0.0,
            tool_runs: vec![],
            error: Some("tool exploded".into()),
            output: serde_json::Value::Null,
        });
        assert_eq!(s.error.as_deref(), Some("tool exploded"));
    }
}
