//! Unified error types for the vigil platform.
//!
//! Every subsystem boundary returns typed results; the taxonomy below is the
//! single vocabulary adapters, the scheduler, the engine and the broker use
//! to classify failures.

use thiserror::Error;

/// Result type alias for vigil operations
pub type VigilResult<T> = Result<T, VigilError>;

/// Failure taxonomy for a single adapter run.
///
/// Exactly one of these is raised per failed stage. The scheduler consults
/// [`AdapterError::is_retryable`] when deciding whether another attempt is
/// worthwhile.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// Request violates the descriptor or schema; never retried.
    #[error("invalid input at {field_path}: {reason}")]
    InvalidInput { reason: String, field_path: String },

    /// Backing binary or service is unreachable; never retried, but a single
    /// failover to a declared fallback adapter is permitted.
    #[error("tool binary not found: {tool_id}")]
    ToolMissing { tool_id: String },

    /// The external process exited abnormally.
    #[error("execution failed with exit code {exit_code:?}: {stderr_tail}")]
    ExecutionFailed {
        exit_code: Option<i32>,
        stderr_tail: String,
    },

    /// Deadline breached. `partial` holds streamed output captured before
    /// the breach, if the tool produced any.
    #[error("execution timed out")]
    Timeout { partial: Option<String> },

    /// Native output could not be mapped to unified findings. Deterministic
    /// on the same input, so never retried.
    #[error("failed to parse tool output: {0}")]
    ParseError(String),

    /// Cancellation signal observed.
    #[error("execution canceled")]
    Canceled,
}

impl AdapterError {
    /// Short machine-readable kind tag, used in wire payloads and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. } => "invalid_input",
            Self::ToolMissing { .. } => "tool_missing",
            Self::ExecutionFailed { .. } => "execution_failed",
            Self::Timeout { .. } => "timeout",
            Self::ParseError(_) => "parse_error",
            Self::Canceled => "canceled",
        }
    }

    /// Whether the scheduler may retry this failure.
    ///
    /// `ExecutionFailed` is only conditionally retryable; the exit-code
    /// whitelist check lives in the scheduler's retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::ExecutionFailed { .. })
    }

    pub fn invalid_input(reason: impl Into<String>, field_path: impl Into<String>) -> Self {
        Self::InvalidInput {
            reason: reason.into(),
            field_path: field_path.into(),
        }
    }

    pub fn tool_missing(tool_id: impl Into<String>) -> Self {
        Self::ToolMissing {
            tool_id: tool_id.into(),
        }
    }

    pub fn execution_failed(exit_code: Option<i32>, stderr_tail: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            exit_code,
            stderr_tail: stderr_tail.into(),
        }
    }
}

/// Errors raised by the checkpoint/metadata store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("checkpoint {seq} not found for workflow {workflow_id}")]
    CheckpointNotFound { workflow_id: String, seq: u64 },

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Errors raised by the workflow engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("workflow {workflow_id} is in phase {phase}, cannot {action}")]
    InvalidPhase {
        workflow_id: String,
        phase: String,
        action: &'static str,
    },

    #[error("no adapter registered for tool id: {0}")]
    UnknownTool(String),

    #[error("invalid workflow request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

/// Top-level error for the vigil platform.
#[derive(Error, Debug)]
pub enum VigilError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classes() {
        assert!(AdapterError::Timeout { partial: None }.is_retryable());
        assert!(AdapterError::execution_failed(Some(2), "oom").is_retryable());
        assert!(!AdapterError::invalid_input("missing path", "target.path").is_retryable());
        assert!(!AdapterError::ParseError("bad json".into()).is_retryable());
        assert!(!AdapterError::tool_missing("semgrep").is_retryable());
    }

    #[test]
    fn kind_tags() {
        assert_eq!(AdapterError::Canceled.kind(), "canceled");
        assert_eq!(
            AdapterError::Timeout { partial: None }.kind(),
            "timeout"
        );
    }
}
