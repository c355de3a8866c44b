//! Workflow configuration.
//!
//! Every knob is an enumerated field with a fixed effect; there is no
//! free-form option map. Unknown options are a deserialization error.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Retry policy knobs for the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Base delay before the first retry, in seconds.
    pub base_backoff_secs: f64,
    /// Multiplier applied per attempt.
    pub backoff_factor: f64,
    /// Ceiling on any single backoff delay, in seconds.
    pub max_backoff_secs: f64,
    /// Exit codes of `ExecutionFailed` that remain retryable.
    pub retryable_exit_codes: Vec<i32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_secs: 1.0,
            backoff_factor: 2.0,
            max_backoff_secs: 60.0,
            // Transient infra failures; validation-style exits stay fatal.
            retryable_exit_codes: vec![137, 143],
        }
    }
}

impl RetryConfig {
    /// Backoff before attempt number `attempt` (0-based retry index):
    /// `min(max_backoff, base * factor^attempt)`.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let raw = self.base_backoff_secs * self.backoff_factor.powi(attempt as i32);
        Duration::from_secs_f64(raw.min(self.max_backoff_secs))
    }

    /// A stricter variant used by the `retry` workflow node: one attempt,
    /// shorter backoff.
    pub fn strict(&self) -> Self {
        Self {
            max_retries: 1,
            base_backoff_secs: self.base_backoff_secs,
            backoff_factor: 1.0,
            max_backoff_secs: self.base_backoff_secs,
            retryable_exit_codes: self.retryable_exit_codes.clone(),
        }
    }
}

/// Timeout knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutConfig {
    /// Budget for an entire workflow run, in seconds.
    pub workflow_total_secs: u64,
    /// Default per-node budget, in seconds.
    pub per_node_default_secs: u64,
    /// Per-tool overrides, keyed by tool id.
    #[serde(default)]
    pub per_tool_override_secs: HashMap<String, u64>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            workflow_total_secs: 3600,
            per_node_default_secs: 1800,
            per_tool_override_secs: HashMap::new(),
        }
    }
}

impl TimeoutConfig {
    /// Node budget for one tool: the per-tool override if present,
    /// otherwise the per-node default.
    pub fn node_budget(&self, tool_id: &str) -> Duration {
        let secs = self
            .per_tool_override_secs
            .get(tool_id)
            .copied()
            .unwrap_or(self.per_node_default_secs);
        Duration::from_secs(secs)
    }
}

/// Concurrency knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConcurrencyConfig {
    /// Maximum tool tasks running at once inside one workflow.
    pub max_parallel_tools: usize,
    /// Maximum workflows the engine drives at once.
    pub max_parallel_workflows: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_parallel_tools: 4,
            max_parallel_workflows: 8,
        }
    }
}

/// Checkpoint knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointConfig {
    /// Whether checkpoints are persisted at all.
    pub enabled: bool,
    /// How many checkpoints to retain per workflow; older ones are pruned.
    pub retention_count: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_count: 32,
        }
    }
}

/// Grace period between the gentle terminate signal and a forceful kill
/// for external processes, in seconds.
pub const DEFAULT_KILL_GRACE_SECS: u64 = 5;

/// Aggregate workflow configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub timeout: TimeoutConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}
