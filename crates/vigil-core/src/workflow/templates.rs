//! Scenario templates: named, predefined plan shapes.

use crate::workflow::state::{NodeKind, NodeSpec, WorkflowType};
use serde::Serialize;

/// A named plan shape bound to a workflow type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScenarioTemplate {
    pub workflow_type: WorkflowType,
    pub name: &'static str,
    pub description: &'static str,
    pub nodes: Vec<NodeSpec>,
}

fn plan(kinds: &[NodeKind]) -> Vec<NodeSpec> {
    kinds.iter().copied().map(NodeSpec::new).collect()
}

/// Plan for a workflow type. `Custom` has no template; callers supply an
/// explicit plan.
pub fn plan_for(workflow_type: WorkflowType) -> Option<Vec<NodeSpec>> {
    use NodeKind::*;
    let nodes = match workflow_type {
        WorkflowType::CodeCommit => plan(&[Initialize, SingleScan, ResultCollection, Finalize]),
        WorkflowType::DependencyUpdate => plan(&[Initialize, SingleScan, Validation, Finalize]),
        WorkflowType::EmergencyVuln => plan(&[
            Initialize,
            ParallelScan,
            ResultCollection,
            Validation,
            Finalize,
        ]),
        WorkflowType::ReleaseRegression => plan(&[
            Initialize,
            ParallelScan,
            ResultCollection,
            Validation,
            HumanReview,
            Finalize,
        ]),
        WorkflowType::Custom => return None,
    };
    Some(nodes)
}

/// All built-in templates, for discovery APIs.
pub fn templates() -> Vec<ScenarioTemplate> {
    [
        (
            WorkflowType::CodeCommit,
            "code_commit",
            "Fast single-tool scan on every commit",
        ),
        (
            WorkflowType::DependencyUpdate,
            "dependency_update",
            "Dependency scan with policy validation",
        ),
        (
            WorkflowType::EmergencyVuln,
            "emergency_vuln",
            "Broad parallel sweep for an urgent disclosure",
        ),
        (
            WorkflowType::ReleaseRegression,
            "release_regression",
            "Full regression with human sign-off before release",
        ),
    ]
    .into_iter()
    .map(|(workflow_type, name, description)| ScenarioTemplate {
        workflow_type,
        name,
        description,
        nodes: plan_for(workflow_type).expect("built-in template"),
    })
    .collect()
}

/// Validate an explicit plan: non-empty, forward-only shape with
/// `initialize` first and `finalize` last.
pub fn validate_plan(nodes: &[NodeSpec]) -> Result<(), String> {
    if nodes.is_empty() {
        return Err("plan must not be empty".to_string());
    }
    if nodes.first().map(|n| n.kind) != Some(NodeKind::Initialize) {
        return Err("plan must begin with initialize".to_string());
    }
    if nodes.last().map(|n| n.kind) != Some(NodeKind::Finalize) {
        return Err("plan must end with finalize".to_string());
    }
    let interior = &nodes[1..nodes.len() - 1];
    if interior
        .iter()
        .any(|n| matches!(n.kind, NodeKind::Initialize | NodeKind::Finalize))
    {
        return Err("initialize/finalize may only appear at the plan edges".to_string());
    }
    Ok(())
}
