//! The workflow engine.
//!
//! One engine drives many workflows. Per workflow, all state mutations
//! happen on the engine's serializing drive loop; readers get copies
//! through the status API. The engine owns no scheduling logic beyond
//! submitting tasks to the [`Scheduler`] and folding the returned outcomes
//! back into the state, which keeps the engine/scheduler relationship a
//! pure request/response cycle.

use crate::adapter::base::RunFailure;
use crate::adapter::registry::ToolRegistry;
use crate::config::WorkflowConfig;
use crate::error::{AdapterError, EngineError, VigilResult};
use crate::normalize::dedup::{aggregate, sort_for_state};
use crate::scheduler::{Scheduler, SchedulerConfig, TaskReport, ToolTask};
use crate::schema::finding::Finding;
use crate::schema::request::{
    ScanContext, ScanLimits, ScanOptions, ScanRequest, ScanTarget, TargetKind,
};
use crate::workflow::events::{EventHub, WorkflowEvent};
use crate::workflow::state::{
    NodeKind, NodeResult, NodeSpec, NodeStatus, ToolRunRecord, WorkflowPhase, WorkflowState,
    WorkflowSummary, WorkflowType,
};
use crate::workflow::storage::{Checkpoint, WorkflowMetadata, WorkflowStore};
use crate::workflow::templates;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// A request to create one workflow.
#[derive(Debug, Clone)]
pub struct WorkflowRequest {
    pub workflow_type: WorkflowType,
    pub target: ScanTarget,
    /// Tools to run; empty means every registered tool.
    pub tool_ids: Vec<String>,
    pub options: ScanOptions,
    pub limits: ScanLimits,
    pub network_allowed: bool,
    /// Explicit plan; required for `Custom`, overrides the template
    /// otherwise.
    pub plan: Option<Vec<NodeSpec>>,
    pub project_name: Option<String>,
    pub triggered_by: Option<String>,
}

impl WorkflowRequest {
    pub fn new(workflow_type: WorkflowType, target: ScanTarget) -> Self {
        Self {
            workflow_type,
            target,
            tool_ids: Vec::new(),
            options: ScanOptions::default(),
            limits: ScanLimits::default(),
            network_allowed: false,
            plan: None,
            project_name: None,
            triggered_by: None,
        }
    }

    pub fn with_tools<I, S>(mut self, tool_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tool_ids = tool_ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_options(mut self, options: ScanOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_limits(mut self, limits: ScanLimits) -> Self {
        self.limits = limits;
        self
    }
}

struct WorkflowHandle {
    state: Arc<RwLock<WorkflowState>>,
    cancel: CancellationToken,
    pause_requested: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
}

enum NodeControl {
    Continue,
    Pause,
    Fail,
    Canceled,
}

struct NodeOutcome {
    result: NodeResult,
    control: NodeControl,
}

/// Stateful driver of workflow plans.
pub struct WorkflowEngine {
    registry: Arc<ToolRegistry>,
    store: Arc<dyn WorkflowStore>,
    events: Arc<EventHub>,
    config: WorkflowConfig,
    scheduler: Scheduler,
    workflows: DashMap<String, WorkflowHandle>,
    workflow_slots: Arc<Semaphore>,
}

impl WorkflowEngine {
    pub fn new(
        registry: Arc<ToolRegistry>,
        store: Arc<dyn WorkflowStore>,
        events: Arc<EventHub>,
        config: WorkflowConfig,
    ) -> Self {
        let scheduler = Scheduler::new(SchedulerConfig {
            max_parallel: config.concurrency.max_parallel_tools,
            retry: config.retry.clone(),
            cancel_grace: Duration::from_secs(crate::config::DEFAULT_KILL_GRACE_SECS),
        });
        let workflow_slots = Arc::new(Semaphore::new(config.concurrency.max_parallel_workflows));
        Self {
            registry,
            store,
            events,
            config,
            scheduler,
            workflows: DashMap::new(),
            workflow_slots,
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    /// Create a workflow from a request; returns its id. The workflow is
    /// `PENDING` until [`WorkflowEngine::execute`] is called.
    pub async fn create(&self, request: WorkflowRequest) -> VigilResult<String> {
        let plan = match request.plan {
            Some(plan) => plan,
            None => templates::plan_for(request.workflow_type).ok_or_else(|| {
                EngineError::InvalidRequest(
                    "custom workflows require an explicit plan".to_string(),
                )
            })?,
        };
        templates::validate_plan(&plan).map_err(EngineError::InvalidRequest)?;

        let workflow_id = Uuid::new_v4().to_string();
        let mut state = WorkflowState::new(
            workflow_id.clone(),
            request.workflow_type,
            request.target,
            plan,
        );
        state.selected_tool_ids = request.tool_ids;
        state.options = request.options;
        state.limits = request.limits;
        state.network_allowed = request.network_allowed;
        if let Some(project) = request.project_name {
            state
                .context
                .insert("project_name".into(), serde_json::json!(project));
        }
        if let Some(principal) = request.triggered_by {
            state
                .context
                .insert("triggered_by".into(), serde_json::json!(principal));
        }

        self.store
            .put_workflow_metadata(WorkflowMetadata::of(&state))
            .await
            .map_err(EngineError::Store)?;

        info!(workflow_id = %workflow_id, workflow_type = %state.workflow_type, "workflow created");
        self.workflows.insert(
            workflow_id.clone(),
            WorkflowHandle {
                state: Arc::new(RwLock::new(state)),
                cancel: CancellationToken::new(),
                pause_requested: Arc::new(AtomicBool::new(false)),
                running: Arc::new(AtomicBool::new(false)),
            },
        );
        Ok(workflow_id)
    }

    /// Drive a workflow until it pauses or reaches a terminal phase.
    pub async fn execute(&self, workflow_id: &str) -> VigilResult<WorkflowSummary> {
        self.drive(workflow_id).await
    }

    /// Request a pause. Takes effect after the currently executing node
    /// completes; in-flight tasks are not canceled.
    pub fn pause(&self, workflow_id: &str) -> VigilResult<()> {
        let handle = self.handle(workflow_id)?;
        handle.pause_requested.store(true, Ordering::SeqCst);
        info!(workflow_id = %workflow_id, "pause requested");
        Ok(())
    }

    /// Resume a paused (or restored) workflow, optionally from an earlier
    /// checkpoint, optionally attaching a human-review annotation.
    pub async fn resume(
        &self,
        workflow_id: &str,
        from_seq: Option<u64>,
        annotation: Option<serde_json::Value>,
    ) -> VigilResult<WorkflowSummary> {
        if !self.workflows.contains_key(workflow_id) {
            // Engine restarted since the workflow was created: rehydrate
            // the handle from the latest persisted checkpoint.
            let checkpoint = self
                .store
                .get_checkpoint(workflow_id, None)
                .await
                .map_err(EngineError::Store)?;
            self.workflows.insert(
                workflow_id.to_string(),
                WorkflowHandle {
                    state: Arc::new(RwLock::new(checkpoint.state)),
                    cancel: CancellationToken::new(),
                    pause_requested: Arc::new(AtomicBool::new(false)),
                    running: Arc::new(AtomicBool::new(false)),
                },
            );
        }

        let state_lock = {
            let handle = self.handle(workflow_id)?;
            if handle.running.load(Ordering::SeqCst) {
                let phase = handle.state.read().phase;
                return Err(EngineError::InvalidPhase {
                    workflow_id: workflow_id.to_string(),
                    phase: phase.to_string(),
                    action: "resume",
                }
                .into());
            }
            Arc::clone(&handle.state)
        };

        if let Some(seq) = from_seq {
            // Explicit reset transition: restore an earlier snapshot.
            let checkpoint = self
                .store
                .get_checkpoint(workflow_id, Some(seq))
                .await
                .map_err(EngineError::Store)?;
            *state_lock.write() = checkpoint.state;
            info!(workflow_id = %workflow_id, seq, "state restored from checkpoint");
        }

        {
            let mut state = state_lock.write();
            if state.phase.is_terminal() {
                return Err(EngineError::InvalidPhase {
                    workflow_id: workflow_id.to_string(),
                    phase: state.phase.to_string(),
                    action: "resume",
                }
                .into());
            }
            if let Some(annotation) = annotation {
                state
                    .context
                    .insert("human_review.annotation".into(), annotation);
            }
        }

        self.drive(workflow_id).await
    }

    /// Cancel a workflow, propagating to all in-flight tasks.
    pub async fn cancel(&self, workflow_id: &str) -> VigilResult<()> {
        let (state_lock, cancel, running) = {
            let handle = self.handle(workflow_id)?;
            (
                Arc::clone(&handle.state),
                handle.cancel.clone(),
                Arc::clone(&handle.running),
            )
        };
        cancel.cancel();
        info!(workflow_id = %workflow_id, "cancellation requested");

        // If nothing is driving the workflow, apply the transition now;
        // otherwise the drive loop records it.
        if !running.load(Ordering::SeqCst) {
            let snapshot = {
                let mut state = state_lock.write();
                if state.phase.is_terminal() {
                    return Ok(());
                }
                state.set_phase(WorkflowPhase::Canceled);
                state.checkpoint_seq += 1;
                state.clone()
            };
            self.persist(&snapshot).await?;
            self.events.publish(workflow_id, WorkflowEvent::CheckpointSaved {
                seq: snapshot.checkpoint_seq,
            });
            self.events.publish(
                workflow_id,
                WorkflowEvent::WorkflowFinished {
                    phase: WorkflowPhase::Canceled,
                },
            );
        }
        Ok(())
    }

    /// Current summary of a workflow.
    pub fn status(&self, workflow_id: &str) -> VigilResult<WorkflowSummary> {
        Ok(self.handle(workflow_id)?.state.read().summary())
    }

    /// Full state copy for external readers.
    pub fn state_snapshot(&self, workflow_id: &str) -> VigilResult<WorkflowState> {
        Ok(self.handle(workflow_id)?.state.read().clone())
    }

    /// Cloned findings export.
    pub fn findings(&self, workflow_id: &str) -> VigilResult<Vec<Finding>> {
        Ok(self.handle(workflow_id)?.state.read().findings.clone())
    }

    /// Summaries of all known workflows, optionally filtered by phase.
    pub fn list_workflows(&self, phase: Option<WorkflowPhase>) -> Vec<WorkflowSummary> {
        let mut summaries: Vec<_> = self
            .workflows
            .iter()
            .map(|h| h.state.read().summary())
            .filter(|s| phase.map(|p| s.phase == p).unwrap_or(true))
            .collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        summaries
    }

    pub async fn list_checkpoints(&self, workflow_id: &str) -> VigilResult<Vec<u64>> {
        Ok(self
            .store
            .list_checkpoints(workflow_id)
            .await
            .map_err(EngineError::Store)?)
    }

    /// Forget a workflow and delete its persisted data.
    pub async fn delete_workflow(&self, workflow_id: &str) -> VigilResult<()> {
        self.workflows.remove(workflow_id);
        self.events.remove(workflow_id);
        self.store
            .delete_workflow(workflow_id)
            .await
            .map_err(EngineError::Store)?;
        Ok(())
    }

    fn handle(
        &self,
        workflow_id: &str,
    ) -> Result<dashmap::mapref::one::Ref<'_, String, WorkflowHandle>, EngineError> {
        self.workflows
            .get(workflow_id)
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))
    }

    // ===== drive loop =====

    async fn drive(&self, workflow_id: &str) -> VigilResult<WorkflowSummary> {
        let (state_lock, cancel, pause_requested, running) = {
            let handle = self.handle(workflow_id)?;
            (
                Arc::clone(&handle.state),
                handle.cancel.clone(),
                Arc::clone(&handle.pause_requested),
                Arc::clone(&handle.running),
            )
        };

        if running.swap(true, Ordering::SeqCst) {
            let phase = state_lock.read().phase;
            return Err(EngineError::InvalidPhase {
                workflow_id: workflow_id.to_string(),
                phase: phase.to_string(),
                action: "execute",
            }
            .into());
        }
        let _permit = self
            .workflow_slots
            .acquire()
            .await
            .expect("workflow semaphore never closed");

        let result = self
            .drive_inner(workflow_id, &state_lock, &cancel, &pause_requested)
            .await;
        running.store(false, Ordering::SeqCst);
        result
    }

    async fn drive_inner(
        &self,
        workflow_id: &str,
        state_lock: &Arc<RwLock<WorkflowState>>,
        cancel: &CancellationToken,
        pause_requested: &AtomicBool,
    ) -> VigilResult<WorkflowSummary> {
        {
            let mut state = state_lock.write();
            match state.phase {
                WorkflowPhase::Pending => state.set_phase(WorkflowPhase::Running),
                WorkflowPhase::Paused => {
                    state.set_phase(WorkflowPhase::Running);
                    self.events.publish(workflow_id, WorkflowEvent::Resumed);
                }
                WorkflowPhase::Running => {}
                terminal => {
                    let phase = terminal.to_string();
                    return Err(EngineError::InvalidPhase {
                        workflow_id: workflow_id.to_string(),
                        phase,
                        action: "execute",
                    }
                    .into());
                }
            }
        }

        loop {
            if cancel.is_cancelled() {
                self.finish(workflow_id, state_lock, WorkflowPhase::Canceled)
                    .await?;
                break;
            }

            let (node, index) = {
                let state = state_lock.read();
                match state.current_node() {
                    Some(node) => (node, state.cursor),
                    None => break,
                }
            };

            self.events.publish(
                workflow_id,
                WorkflowEvent::NodeStarted {
                    kind: node.kind,
                    index,
                },
            );

            let outcome = self
                .execute_node(workflow_id, state_lock, node, index, cancel)
                .await;

            let snapshot = {
                let mut state = state_lock.write();
                let status = outcome.result.status;
                state.record_node(outcome.result.clone());
                match outcome.control {
                    NodeControl::Continue | NodeControl::Pause => {
                        state.advance_cursor();
                    }
                    NodeControl::Fail => state.set_phase(WorkflowPhase::Failed),
                    NodeControl::Canceled => state.set_phase(WorkflowPhase::Canceled),
                }
                if matches!(outcome.control, NodeControl::Pause) {
                    state.set_phase(WorkflowPhase::Paused);
                }
                state.checkpoint_seq += 1;
                self.events.publish(
                    workflow_id,
                    WorkflowEvent::NodeFinished {
                        kind: node.kind,
                        index,
                        status: format!("{status:?}").to_uppercase(),
                    },
                );
                state.clone()
            };

            // Checkpoint before side effects of the next node begin.
            self.persist(&snapshot).await?;
            self.events.publish(
                workflow_id,
                WorkflowEvent::CheckpointSaved {
                    seq: snapshot.checkpoint_seq,
                },
            );
            self.events.publish(
                workflow_id,
                WorkflowEvent::Progress {
                    value: snapshot.progress,
                },
            );

            match outcome.control {
                NodeControl::Continue => {}
                NodeControl::Pause => {
                    self.events.publish(workflow_id, WorkflowEvent::Paused);
                    info!(workflow_id = %workflow_id, "workflow paused");
                    return Ok(snapshot.summary());
                }
                NodeControl::Fail => {
                    error!(workflow_id = %workflow_id, error = ?snapshot.error, "workflow failed");
                    self.events.publish(
                        workflow_id,
                        WorkflowEvent::WorkflowFinished {
                            phase: WorkflowPhase::Failed,
                        },
                    );
                    return Ok(snapshot.summary());
                }
                NodeControl::Canceled => {
                    self.events.publish(
                        workflow_id,
                        WorkflowEvent::WorkflowFinished {
                            phase: WorkflowPhase::Canceled,
                        },
                    );
                    return Ok(snapshot.summary());
                }
            }

            if pause_requested.swap(false, Ordering::SeqCst) {
                let snapshot = {
                    let mut state = state_lock.write();
                    if state.phase == WorkflowPhase::Running {
                        state.set_phase(WorkflowPhase::Paused);
                        state.checkpoint_seq += 1;
                    }
                    state.clone()
                };
                if snapshot.phase == WorkflowPhase::Paused {
                    self.persist(&snapshot).await?;
                    self.events.publish(
                        workflow_id,
                        WorkflowEvent::CheckpointSaved {
                            seq: snapshot.checkpoint_seq,
                        },
                    );
                    self.events.publish(workflow_id, WorkflowEvent::Paused);
                    return Ok(snapshot.summary());
                }
            }
        }

        let summary = self.handle(workflow_id).map(|h| h.state.read().summary())?;
        // Failed/canceled paths publish their finish event where the
        // transition happens; the successful path ends here.
        if summary.phase == WorkflowPhase::Succeeded {
            self.events.publish(
                workflow_id,
                WorkflowEvent::WorkflowFinished {
                    phase: WorkflowPhase::Succeeded,
                },
            );
        }
        Ok(summary)
    }

    /// Terminal transition applied from the loop head (cancellation seen
    /// between nodes).
    async fn finish(
        &self,
        workflow_id: &str,
        state_lock: &Arc<RwLock<WorkflowState>>,
        phase: WorkflowPhase,
    ) -> VigilResult<()> {
        let snapshot = {
            let mut state = state_lock.write();
            if state.phase.is_terminal() {
                return Ok(());
            }
            state.set_phase(phase);
            state.checkpoint_seq += 1;
            state.clone()
        };
        self.persist(&snapshot).await?;
        self.events.publish(
            workflow_id,
            WorkflowEvent::CheckpointSaved {
                seq: snapshot.checkpoint_seq,
            },
        );
        self.events
            .publish(workflow_id, WorkflowEvent::WorkflowFinished { phase });
        Ok(())
    }

    async fn persist(&self, state: &WorkflowState) -> VigilResult<()> {
        if self.config.checkpoint.enabled {
            self.store
                .put_checkpoint(Checkpoint::of(state))
                .await
                .map_err(EngineError::Store)?;
        }
        self.store
            .put_workflow_metadata(WorkflowMetadata::of(state))
            .await
            .map_err(EngineError::Store)?;
        Ok(())
    }

    // ===== nodes =====

    async fn execute_node(
        &self,
        workflow_id: &str,
        state_lock: &Arc<RwLock<WorkflowState>>,
        node: NodeSpec,
        index: usize,
        cancel: &CancellationToken,
    ) -> NodeOutcome {
        let started_at = Utc::now();
        let mut result = NodeResult {
            kind: node.kind,
            index,
            status: NodeStatus::Succeeded,
            started_at,
            finished_at: started_at,
            duration_secs: 0.0,
            tool_runs: Vec::new(),
            error: None,
            output: serde_json::Value::Null,
        };

        let control = match node.kind {
            NodeKind::Initialize => self.node_initialize(workflow_id, state_lock, &mut result),
            NodeKind::SingleScan => {
                self.node_single_scan(workflow_id, state_lock, &mut result, cancel, &self.scheduler)
                    .await
            }
            NodeKind::ParallelScan => {
                self.node_parallel_scan(
                    workflow_id,
                    state_lock,
                    &mut result,
                    cancel,
                    &self.scheduler,
                )
                .await
            }
            NodeKind::ResultCollection => {
                self.node_result_collection(workflow_id, state_lock, &mut result)
            }
            NodeKind::Validation => self.node_validation(state_lock, &mut result),
            NodeKind::HumanReview => self.node_human_review(state_lock, &mut result),
            NodeKind::Retry => {
                self.node_retry(workflow_id, state_lock, &mut result, cancel)
                    .await
            }
            NodeKind::Finalize => self.node_finalize(state_lock, &mut result),
        };

        result.finished_at = Utc::now();
        result.duration_secs = (result.finished_at - result.started_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        match &control {
            NodeControl::Fail => result.status = NodeStatus::Failed,
            NodeControl::Canceled => result.status = NodeStatus::Canceled,
            NodeControl::Pause => result.status = NodeStatus::Paused,
            NodeControl::Continue => {}
        }
        NodeOutcome { result, control }
    }

    fn node_initialize(
        &self,
        workflow_id: &str,
        state_lock: &Arc<RwLock<WorkflowState>>,
        result: &mut NodeResult,
    ) -> NodeControl {
        let mut state = state_lock.write();

        if state.target.location.trim().is_empty() {
            result.error = Some("scan target location must not be empty".to_string());
            return NodeControl::Fail;
        }

        if state.selected_tool_ids.is_empty() {
            state.selected_tool_ids = self.registry.tool_ids();
            warn!(workflow_id = %workflow_id, "no tools selected, using all registered");
        }
        if state.selected_tool_ids.is_empty() {
            result.error = Some("no tool adapters registered".to_string());
            return NodeControl::Fail;
        }

        for tool_id in &state.selected_tool_ids {
            if !self.registry.contains(tool_id) {
                result.error = Some(format!("unknown tool id: {tool_id}"));
                return NodeControl::Fail;
            }
        }

        result.output = serde_json::json!({
            "tool_count": state.selected_tool_ids.len(),
            "tools": state.selected_tool_ids,
            "target": state.target.location,
        });
        drop(state);
        self.events
            .publish(workflow_id, WorkflowEvent::WorkflowStarted);
        NodeControl::Continue
    }

    async fn node_single_scan(
        &self,
        workflow_id: &str,
        state_lock: &Arc<RwLock<WorkflowState>>,
        result: &mut NodeResult,
        cancel: &CancellationToken,
        scheduler: &Scheduler,
    ) -> NodeControl {
        let (tool_id, request) = {
            let state = state_lock.read();
            let Some(tool_id) = state.selected_tool_ids.first().cloned() else {
                result.error = Some("single_scan requires one selected tool".to_string());
                return NodeControl::Fail;
            };
            (tool_id, self.scan_request(&state))
        };

        self.events.publish(
            workflow_id,
            WorkflowEvent::ToolStarted {
                tool_id: tool_id.clone(),
            },
        );
        let report = self
            .run_tool_with_failover(workflow_id, &tool_id, &request, cancel, scheduler)
            .await;
        self.record_report(workflow_id, state_lock, result, &report);

        match &report.result {
            Ok(_) => NodeControl::Continue,
            Err(failure) if matches!(failure.error, AdapterError::Canceled) => {
                NodeControl::Canceled
            }
            Err(failure) => {
                result.error = Some(failure.error.to_string());
                NodeControl::Fail
            }
        }
    }

    async fn node_parallel_scan(
        &self,
        workflow_id: &str,
        state_lock: &Arc<RwLock<WorkflowState>>,
        result: &mut NodeResult,
        cancel: &CancellationToken,
        scheduler: &Scheduler,
    ) -> NodeControl {
        let (tool_ids, request) = {
            let state = state_lock.read();
            (state.selected_tool_ids.clone(), self.scan_request(&state))
        };

        let mut tasks = Vec::with_capacity(tool_ids.len());
        for tool_id in &tool_ids {
            self.events.publish(
                workflow_id,
                WorkflowEvent::ToolStarted {
                    tool_id: tool_id.clone(),
                },
            );
            tasks.push(self.build_task(tool_id, &request));
        }

        let reports = scheduler.run_all(tasks, cancel.clone()).await;

        let mut final_reports = Vec::with_capacity(reports.len());
        for report in reports {
            let report = match &report.result {
                Err(failure)
                    if matches!(failure.error, AdapterError::ToolMissing { .. }) =>
                {
                    self.failover(workflow_id, report, &request, cancel, scheduler)
                        .await
                }
                _ => report,
            };
            final_reports.push(report);
        }

        for report in &final_reports {
            self.record_report(workflow_id, state_lock, result, report);
        }

        if cancel.is_cancelled() {
            return NodeControl::Canceled;
        }
        if final_reports.iter().any(TaskReport::is_success) {
            NodeControl::Continue
        } else {
            result.error = Some(
                final_reports
                    .iter()
                    .filter_map(|r| r.result.as_ref().err())
                    .map(|f| f.error.to_string())
                    .collect::<Vec<_>>()
                    .join("; "),
            );
            NodeControl::Fail
        }
    }

    fn node_result_collection(
        &self,
        workflow_id: &str,
        state_lock: &Arc<RwLock<WorkflowState>>,
        result: &mut NodeResult,
    ) -> NodeControl {
        let mut state = state_lock.write();
        let before = state.findings.len();
        let merged = aggregate(std::mem::take(&mut state.findings));
        let correlated = merged
            .iter()
            .filter(|f| f.metadata.tags.contains("correlated"))
            .count();
        let mut by_severity = std::collections::BTreeMap::new();
        for finding in &merged {
            *by_severity
                .entry(finding.severity.level.to_string())
                .or_insert(0usize) += 1;
        }
        state.findings = merged;
        result.output = serde_json::json!({
            "input_count": before,
            "deduplicated_count": state.findings.len(),
            "correlated_count": correlated,
            "severity_distribution": by_severity,
        });
        info!(
            workflow_id = %workflow_id,
            input = before,
            output = state.findings.len(),
            "findings collected"
        );
        NodeControl::Continue
    }

    fn node_validation(
        &self,
        state_lock: &Arc<RwLock<WorkflowState>>,
        result: &mut NodeResult,
    ) -> NodeControl {
        let mut state = state_lock.write();
        let floor = state.options.severity_floor;
        let exclusions = state.options.cwe_exclusions.clone();

        let mut marked = 0usize;
        for finding in &mut state.findings {
            let below_floor = floor
                .map(|f| finding.severity.level.rank() > f.rank())
                .unwrap_or(false);
            let excluded_cwe = finding
                .vulnerability_type
                .cwe_id
                .map(|id| exclusions.contains(&id))
                .unwrap_or(false);
            if below_floor || excluded_cwe {
                finding.metadata.tags.insert("non_conformant".to_string());
                marked += 1;
            }
        }
        result.output = serde_json::json!({
            "total": state.findings.len(),
            "non_conformant": marked,
        });
        NodeControl::Continue
    }

    fn node_human_review(
        &self,
        state_lock: &Arc<RwLock<WorkflowState>>,
        result: &mut NodeResult,
    ) -> NodeControl {
        let mut state = state_lock.write();
        let critical = state
            .findings
            .iter()
            .filter(|f| f.severity.level == crate::schema::finding::SeverityLevel::Critical)
            .count();
        let high = state
            .findings
            .iter()
            .filter(|f| f.severity.level == crate::schema::finding::SeverityLevel::High)
            .count();
        let payload = serde_json::json!({
            "total_findings": state.findings.len(),
            "critical_count": critical,
            "high_count": high,
            "requested_at": Utc::now().to_rfc3339(),
        });
        state
            .context
            .insert("human_review.requested".into(), payload.clone());
        result.output = payload;
        NodeControl::Pause
    }

    async fn node_retry(
        &self,
        workflow_id: &str,
        state_lock: &Arc<RwLock<WorkflowState>>,
        result: &mut NodeResult,
        cancel: &CancellationToken,
    ) -> NodeControl {
        let rerun = {
            let state = state_lock.read();
            let empty = state.findings.is_empty();
            let clean = state
                .last_scan_result()
                .map(|r| r.status == NodeStatus::Succeeded)
                .unwrap_or(false);
            empty && clean
        };

        if !rerun {
            result.output = serde_json::json!({"reran": false});
            return NodeControl::Continue;
        }

        // Empty results with no reported error: one stricter re-run of the
        // preceding scan.
        let strict = Scheduler::new(SchedulerConfig {
            max_parallel: self.scheduler.config().max_parallel,
            retry: self.config.retry.strict(),
            cancel_grace: self.scheduler.config().cancel_grace,
        });
        result.output = serde_json::json!({"reran": true});
        let preceding = {
            let state = state_lock.read();
            state.last_scan_result().map(|r| r.kind)
        };
        match preceding {
            Some(NodeKind::ParallelScan) => {
                self.node_parallel_scan(workflow_id, state_lock, result, cancel, &strict)
                    .await
            }
            _ => {
                self.node_single_scan(workflow_id, state_lock, result, cancel, &strict)
                    .await
            }
        }
    }

    fn node_finalize(
        &self,
        state_lock: &Arc<RwLock<WorkflowState>>,
        result: &mut NodeResult,
    ) -> NodeControl {
        let mut state = state_lock.write();
        if !state.phase.is_terminal() {
            state.set_phase(WorkflowPhase::Succeeded);
        }
        result.output = serde_json::json!({
            "final_phase": state.phase.to_string(),
            "total_findings": state.findings.len(),
            "total_nodes": state.node_results.len() + 1,
        });
        NodeControl::Continue
    }

    // ===== task plumbing =====

    fn scan_request(&self, state: &WorkflowState) -> ScanRequest {
        ScanRequest {
            scan_id: state.workflow_id.clone(),
            target: state.target.clone(),
            options: state.options.clone(),
            context: ScanContext {
                workflow_id: Some(state.workflow_id.clone()),
                project_name: state
                    .context
                    .get("project_name")
                    .and_then(|v| v.as_str())
                    .map(String::from),
                scan_type: Default::default(),
                triggered_by: state
                    .context
                    .get("triggered_by")
                    .and_then(|v| v.as_str())
                    .map(String::from),
            },
            limits: state.limits.clone(),
            network_allowed: state.network_allowed,
            created_at: Utc::now(),
        }
    }

    fn task_deadline(&self, tool_id: &str, request: &ScanRequest) -> Duration {
        let node_budget = self.config.timeout.node_budget(tool_id);
        let descriptor = self
            .registry
            .capability(tool_id)
            .map(|c| Duration::from_secs(c.execution.default_timeout_secs))
            .unwrap_or(node_budget);
        let request_limit = Duration::from_secs(request.limits.timeout_secs);
        node_budget.min(descriptor).min(request_limit)
    }

    fn workdir(request: &ScanRequest) -> PathBuf {
        match request.target.kind {
            TargetKind::LocalPath => PathBuf::from(&request.target.location),
            _ => std::env::temp_dir(),
        }
    }

    fn build_task(&self, tool_id: &str, request: &ScanRequest) -> ToolTask {
        let registry = Arc::clone(&self.registry);
        let request = request.clone();
        let tool = tool_id.to_string();
        let deadline = self.task_deadline(tool_id, &request);
        let workdir = Self::workdir(&request);
        let network_allowed = request.network_allowed;

        ToolTask::new(
            format!("{}:{}", request.scan_id, tool),
            tool.clone(),
            deadline,
            Arc::new(move |cancel| {
                let registry = Arc::clone(&registry);
                let request = request.clone();
                let tool = tool.clone();
                let workdir = workdir.clone();
                Box::pin(async move {
                    let Some(guard) = registry.acquire(&tool) else {
                        return Err(Box::new(RunFailure {
                            error: AdapterError::tool_missing(&tool),
                            partial_findings: Vec::new(),
                            diagnostics: Default::default(),
                        }));
                    };
                    let ctx = crate::adapter::base::ExecutionContext::new(deadline, workdir)
                        .with_network_allowed(network_allowed)
                        .with_cancel(cancel);
                    guard.adapter().run(&request, &ctx).await
                })
            }),
        )
    }

    async fn run_tool_with_failover(
        &self,
        workflow_id: &str,
        tool_id: &str,
        request: &ScanRequest,
        cancel: &CancellationToken,
        scheduler: &Scheduler,
    ) -> TaskReport {
        let report = scheduler
            .run_task(self.build_task(tool_id, request), cancel.clone())
            .await;
        match &report.result {
            Err(failure) if matches!(failure.error, AdapterError::ToolMissing { .. }) => {
                self.failover(workflow_id, report, request, cancel, scheduler)
                    .await
            }
            _ => report,
        }
    }

    /// One failover attempt to the request's declared fallback adapter.
    async fn failover(
        &self,
        workflow_id: &str,
        report: TaskReport,
        request: &ScanRequest,
        cancel: &CancellationToken,
        scheduler: &Scheduler,
    ) -> TaskReport {
        let Some(fallback) = request.options.fallback_tool_id.clone() else {
            return report;
        };
        if fallback == report.tool_id || !self.registry.contains(&fallback) {
            return report;
        }
        self.events.publish(
            workflow_id,
            WorkflowEvent::Diagnostic {
                message: format!(
                    "tool {} unavailable, failing over to {}",
                    report.tool_id, fallback
                ),
            },
        );
        self.events.publish(
            workflow_id,
            WorkflowEvent::ToolStarted {
                tool_id: fallback.clone(),
            },
        );
        scheduler
            .run_task(self.build_task(&fallback, request), cancel.clone())
            .await
    }

    /// Fold one task report into the node result and workflow state.
    fn record_report(
        &self,
        workflow_id: &str,
        state_lock: &Arc<RwLock<WorkflowState>>,
        result: &mut NodeResult,
        report: &TaskReport,
    ) {
        let now = Utc::now();
        let findings = report.findings().to_vec();
        let (success, error, diagnostics) = match &report.result {
            Ok(outcome) => (true, None, outcome.diagnostics.clone()),
            Err(failure) => (
                false,
                Some(failure.error.to_string()),
                failure.diagnostics.clone(),
            ),
        };

        for note in &diagnostics.notes {
            self.events.publish(
                workflow_id,
                WorkflowEvent::Diagnostic {
                    message: note.clone(),
                },
            );
        }

        result.tool_runs.push(ToolRunRecord {
            tool_id: report.tool_id.clone(),
            success,
            attempts: report.attempts,
            started_at: result.started_at,
            finished_at: now,
            duration_secs: diagnostics.duration_secs.unwrap_or(0.0),
            finding_count: findings.len(),
            error,
        });

        let mut state = state_lock.write();
        let max_findings = state.limits.max_findings;
        for finding in &findings {
            self.events.publish(
                workflow_id,
                WorkflowEvent::FindingEmitted {
                    finding_id: finding.finding_id.clone(),
                },
            );
        }
        state.findings.extend(findings);
        sort_for_state(&mut state.findings);
        if let Some(limit) = max_findings {
            state.findings.truncate(limit);
        }
        drop(state);

        self.events.publish(
            workflow_id,
            WorkflowEvent::ToolFinished {
                tool_id: report.tool_id.clone(),
                status: if success {
                    "SUCCEEDED".to_string()
                } else {
                    "FAILED".to_string()
                },
            },
        );
    }
}

/// Convenience: create and immediately execute a workflow.
pub async fn execute_workflow(
    engine: &WorkflowEngine,
    request: WorkflowRequest,
) -> VigilResult<(String, WorkflowSummary)> {
    let workflow_id = engine.create(request).await?;
    let summary = engine.execute(&workflow_id).await?;
    Ok((workflow_id, summary))
}
