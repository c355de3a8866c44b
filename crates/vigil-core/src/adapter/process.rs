//! Subprocess invocation for binary-backed adapters.
//!
//! Runs a tool binary with CWD set to the request workspace, captures
//! stdout/stderr incrementally, honors the context deadline and
//! cancellation token, and escalates from a gentle terminate to a forceful
//! kill after the grace period.

use crate::adapter::base::ExecutionContext;
use crate::config::DEFAULT_KILL_GRACE_SECS;
use crate::error::AdapterError;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Maximum stderr bytes preserved in diagnostics and errors.
const STDERR_TAIL_BYTES: usize = 4096;

/// Description of one command invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment; the parent environment is inherited.
    pub env: HashMap<String, String>,
    /// Grace period between terminate and kill.
    pub kill_grace: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            kill_grace: Duration::from_secs(DEFAULT_KILL_GRACE_SECS),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// SHA-256 over the full argv, recorded in diagnostics.
    pub fn command_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.program.as_bytes());
        for arg in &self.args {
            hasher.update([0x1f]);
            hasher.update(arg.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Captured output of a completed command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration: Duration,
    pub command_hash: String,
}

impl CommandOutput {
    pub fn stderr_tail(&self) -> String {
        tail(&self.stderr)
    }
}

fn tail(text: &str) -> String {
    if text.len() <= STDERR_TAIL_BYTES {
        return text.to_string();
    }
    let cut = text.len() - STDERR_TAIL_BYTES;
    // Keep the cut on a char boundary.
    let start = (cut..text.len())
        .find(|i| text.is_char_boundary(*i))
        .unwrap_or(cut);
    text[start..].to_string()
}

/// Locate a binary on PATH. Adapters use this to distinguish ToolMissing
/// from ExecutionFailed without launching anything.
pub fn find_binary(name: &str) -> Option<std::path::PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Run a command under the context's deadline and cancellation token.
///
/// The process always starts in `ctx.workdir`. On deadline breach the
/// partial stdout captured so far is returned inside
/// [`AdapterError::Timeout`]; on cancellation [`AdapterError::Canceled`]
/// is returned. The exit code is not interpreted here; adapters decide
/// what counts as failure for their tool.
pub async fn run_command(
    spec: &CommandSpec,
    ctx: &ExecutionContext,
) -> Result<CommandOutput, AdapterError> {
    let started = Instant::now();
    let command_hash = spec.command_hash();

    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .current_dir(&ctx.workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in &spec.env {
        command.env(key, value);
    }

    let mut child = command.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            AdapterError::tool_missing(&spec.program)
        } else {
            AdapterError::execution_failed(None, format!("spawn failed: {e}"))
        }
    })?;

    debug!(program = %spec.program, hash = %command_hash, "spawned tool process");

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });

    let deadline = tokio::time::sleep(ctx.deadline);
    tokio::pin!(deadline);

    let status = tokio::select! {
        status = child.wait() => {
            status.map_err(|e| AdapterError::execution_failed(None, e.to_string()))?
        }
        _ = &mut deadline => {
            warn!(program = %spec.program, "deadline breached, terminating");
            terminate_with_grace(&mut child, spec.kill_grace).await;
            let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).into_owned();
            let partial = if stdout.trim().is_empty() { None } else { Some(stdout) };
            return Err(AdapterError::Timeout { partial });
        }
        _ = ctx.cancel.cancelled() => {
            warn!(program = %spec.program, "canceled, terminating");
            terminate_with_grace(&mut child, spec.kill_grace).await;
            return Err(AdapterError::Canceled);
        }
    };

    let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).into_owned();
    let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).into_owned();

    Ok(CommandOutput {
        stdout,
        stderr,
        exit_code: status.code(),
        duration: started.elapsed(),
        command_hash,
    })
}

/// Gentle terminate, then kill after the grace period if the process is
/// still alive.
async fn terminate_with_grace(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            tokio::select! {
                _ = child.wait() => return,
                _ = tokio::time::sleep(grace) => {}
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = grace;
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn ctx(deadline_secs: u64) -> ExecutionContext {
        ExecutionContext::new(Duration::from_secs(deadline_secs), std::env::temp_dir())
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let spec = CommandSpec::new("sh").args(["-c", "echo hello; exit 3"]);
        let out = run_command(&spec, &ctx(10)).await.unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.exit_code, Some(3));
    }

    #[tokio::test]
    async fn missing_binary_is_tool_missing() {
        let spec = CommandSpec::new("vigil-test-binary-that-does-not-exist");
        let err = run_command(&spec, &ctx(10)).await.unwrap_err();
        assert!(matches!(err, AdapterError::ToolMissing { .. }));
    }

    #[tokio::test]
    async fn deadline_breach_returns_timeout_with_partial_stdout() {
        let spec = CommandSpec {
            kill_grace: Duration::from_millis(200),
            ..CommandSpec::new("sh")
        }
        .args(["-c", "echo early; sleep 30"]);
        let mut ctx = ctx(0);
        ctx.deadline = Duration::from_millis(300);

        let started = Instant::now();
        let err = run_command(&spec, &ctx).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(10));
        match err {
            AdapterError::Timeout { partial } => {
                assert_eq!(partial.as_deref().map(str::trim), Some("early"));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_terminates_the_process() {
        let cancel = CancellationToken::new();
        let ctx = ctx(60).with_cancel(cancel.clone());
        let spec = CommandSpec {
            kill_grace: Duration::from_millis(200),
            ..CommandSpec::new("sh")
        }
        .args(["-c", "sleep 30"]);

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let err = run_command(&spec, &ctx).await.unwrap_err();
        assert!(matches!(err, AdapterError::Canceled));
    }

    #[test]
    fn command_hash_is_argv_sensitive() {
        let a = CommandSpec::new("semgrep").arg("--json");
        let b = CommandSpec::new("semgrep").arg("--sarif");
        assert_ne!(a.command_hash(), b.command_hash());
        assert_eq!(a.command_hash(), CommandSpec::new("semgrep").arg("--json").command_hash());
    }

    #[test]
    fn stderr_tail_truncates_on_char_boundary() {
        let long = "é".repeat(STDERR_TAIL_BYTES);
        let out = CommandOutput {
            stdout: String::new(),
            stderr: long,
            exit_code: Some(1),
            duration: Duration::from_secs(1),
            command_hash: String::new(),
        };
        let tail = out.stderr_tail();
        assert!(tail.len() <= STDERR_TAIL_BYTES);
        assert!(tail.chars().all(|c| c == 'é'));
    }
}
