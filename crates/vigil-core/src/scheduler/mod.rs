//! Bounded-concurrency task scheduler with retry, backoff and timeouts.
//!
//! The scheduler dispatches tool-run tasks for the engine. It owns no
//! workflow state: tasks are self-contained closures resolving to a
//! [`RunOutcome`] or a taxonomized failure, and completion is reported back
//! by value, which keeps the engine/scheduler relationship acyclic.

use crate::adapter::base::{RunFailure, RunOutcome};
use crate::config::RetryConfig;
use crate::error::AdapterError;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Factory producing one execution attempt. Invoked once per attempt so
/// retries re-run the tool from scratch.
pub type TaskRunner = Arc<
    dyn Fn(CancellationToken) -> BoxFuture<'static, Result<RunOutcome, Box<RunFailure>>>
        + Send
        + Sync,
>;

/// One schedulable tool run.
#[derive(Clone)]
pub struct ToolTask {
    pub task_id: String,
    pub tool_id: String,
    /// Effective deadline for each attempt:
    /// min(node budget, descriptor timeout, request limit).
    pub deadline: Duration,
    runner: TaskRunner,
}

impl ToolTask {
    pub fn new(
        task_id: impl Into<String>,
        tool_id: impl Into<String>,
        deadline: Duration,
        runner: TaskRunner,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            tool_id: tool_id.into(),
            deadline,
            runner,
        }
    }
}

/// Final report for one task after all attempts.
pub struct TaskReport {
    pub task_id: String,
    pub tool_id: String,
    /// Execution attempts made; never exceeds `max_retries + 1`.
    pub attempts: u32,
    pub result: Result<RunOutcome, Box<RunFailure>>,
}

impl TaskReport {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Findings produced by this task: full results on success, salvaged
    /// partial results on failure.
    pub fn findings(&self) -> &[crate::schema::finding::Finding] {
        match &self.result {
            Ok(outcome) => &outcome.findings,
            Err(failure) => &failure.partial_findings,
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_parallel: usize,
    pub retry: RetryConfig,
    /// Extra time an attempt gets to observe cancellation after its
    /// deadline fires before the scheduler abandons it.
    pub cancel_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            retry: RetryConfig::default(),
            cancel_grace: Duration::from_secs(5),
        }
    }
}

/// Bounded-parallelism dispatcher.
pub struct Scheduler {
    config: SchedulerConfig,
    slots: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_parallel.max(1)));
        Self { config, slots }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run every task to completion (or cancellation) and report per-task
    /// outcomes in submission order. Between tasks with no declared
    /// dependency no ordering is guaranteed; callers sort findings
    /// deterministically afterwards.
    pub async fn run_all(
        &self,
        tasks: Vec<ToolTask>,
        cancel: CancellationToken,
    ) -> Vec<TaskReport> {
        let futures: Vec<_> = tasks
            .into_iter()
            .map(|task| self.run_task(task, cancel.clone()))
            .collect();
        futures::future::join_all(futures).await
    }

    /// Run one task with the configured retry policy.
    pub async fn run_task(&self, task: ToolTask, cancel: CancellationToken) -> TaskReport {
        let mut attempts = 0u32;
        let max_attempts = self.config.retry.max_retries + 1;

        loop {
            // Queued tasks are dropped on cancellation without consuming
            // an attempt.
            if cancel.is_cancelled() {
                return TaskReport {
                    task_id: task.task_id,
                    tool_id: task.tool_id,
                    attempts,
                    result: Err(Box::new(RunFailure {
                        error: AdapterError::Canceled,
                        partial_findings: Vec::new(),
                        diagnostics: Default::default(),
                    })),
                };
            }

            let permit = match self.slots.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => unreachable!("scheduler semaphore is never closed"),
            };
            if cancel.is_cancelled() {
                drop(permit);
                continue; // loop head reports cancellation
            }

            attempts += 1;
            debug!(
                task = %task.task_id,
                tool = %task.tool_id,
                attempt = attempts,
                max = max_attempts,
                "dispatching task"
            );
            let result = self.run_attempt(&task, &cancel).await;
            drop(permit);

            match result {
                Ok(outcome) => {
                    return TaskReport {
                        task_id: task.task_id,
                        tool_id: task.tool_id,
                        attempts,
                        result: Ok(outcome),
                    };
                }
                Err(failure) => {
                    let retryable = attempts < max_attempts
                        && !cancel.is_cancelled()
                        && self.should_retry(&failure.error);
                    if !retryable {
                        if attempts >= max_attempts {
                            warn!(
                                task = %task.task_id,
                                attempts,
                                "retries exhausted"
                            );
                        }
                        return TaskReport {
                            task_id: task.task_id,
                            tool_id: task.tool_id,
                            attempts,
                            result: Err(failure),
                        };
                    }

                    let backoff = self.config.retry.backoff_for_attempt(attempts - 1);
                    info!(
                        task = %task.task_id,
                        error = %failure.error,
                        backoff_secs = backoff.as_secs_f64(),
                        "retrying after backoff"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => {}
                    }
                }
            }
        }
    }

    /// One attempt under the task deadline. A deadline breach cancels the
    /// attempt's child token cooperatively; if the task still does not
    /// yield within the grace period it is abandoned and reported as a
    /// timeout.
    async fn run_attempt(
        &self,
        task: &ToolTask,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, Box<RunFailure>> {
        let attempt_token = cancel.child_token();
        let fut = (task.runner)(attempt_token.clone());
        tokio::pin!(fut);

        let first = tokio::select! {
            res = &mut fut => Some(res),
            _ = tokio::time::sleep(task.deadline) => None,
        };

        let result = match first {
            Some(res) => res,
            None => {
                attempt_token.cancel();
                match tokio::time::timeout(self.config.cancel_grace, &mut fut).await {
                    Ok(res) => res,
                    Err(_) => Err(Box::new(RunFailure {
                        error: AdapterError::Timeout { partial: None },
                        partial_findings: Vec::new(),
                        diagnostics: Default::default(),
                    })),
                }
            }
        };

        // A task that observed our deadline-cancel reports Canceled; from
        // the caller's perspective that attempt timed out, which is
        // retryable. External cancellation stays Canceled.
        match result {
            Err(failure)
                if matches!(failure.error, AdapterError::Canceled) && !cancel.is_cancelled() =>
            {
                Err(Box::new(RunFailure {
                    error: AdapterError::Timeout { partial: None },
                    partial_findings: failure.partial_findings,
                    diagnostics: failure.diagnostics,
                }))
            }
            other => other,
        }
    }

    fn should_retry(&self, error: &AdapterError) -> bool {
        match error {
            AdapterError::Timeout { .. } => true,
            AdapterError::ExecutionFailed { exit_code, .. } => exit_code
                .map(|code| self.config.retry.retryable_exit_codes.contains(&code))
                .unwrap_or(false),
            AdapterError::InvalidInput { .. }
            | AdapterError::ToolMissing { .. }
            | AdapterError::ParseError(_)
            | AdapterError::Canceled => false,
        }
    }
}
