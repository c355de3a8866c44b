//! Stdio transport: spawn a tool-broker process and exchange
//! line-delimited JSON-RPC messages over its stdin/stdout.

use crate::error::BrokerError;
use crate::protocol::RpcMessage;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

/// Duplex line-protocol channel to a child process.
pub struct StdioTransport {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<BufReader<ChildStdout>>,
    line_buffer: String,
    connected: bool,
}

impl StdioTransport {
    /// Spawn a broker (or any line-protocol peer) process.
    pub async fn spawn(
        command: impl AsRef<str>,
        args: &[impl AsRef<str>],
        env: &HashMap<String, String>,
    ) -> Result<Self, BrokerError> {
        let mut cmd = Command::new(command.as_ref());
        cmd.args(args.iter().map(|a| a.as_ref()))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            BrokerError::Connection(format!("failed to spawn '{}': {e}", command.as_ref()))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BrokerError::Connection("no stdin handle".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BrokerError::Connection("no stdout handle".into()))?;

        Ok(Self {
            child: Some(child),
            stdin: Some(stdin),
            stdout: Some(BufReader::new(stdout)),
            line_buffer: String::new(),
            connected: true,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Send one message as a single line.
    pub async fn send(&mut self, message: &RpcMessage) -> Result<(), BrokerError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or(BrokerError::NotConnected)?;
        let json = serde_json::to_string(message)?;
        stdin.write_all(json.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Receive the next message line.
    pub async fn receive(&mut self) -> Result<RpcMessage, BrokerError> {
        let stdout = self
            .stdout
            .as_mut()
            .ok_or(BrokerError::NotConnected)?;

        self.line_buffer.clear();
        let bytes_read = stdout.read_line(&mut self.line_buffer).await?;
        if bytes_read == 0 {
            self.connected = false;
            return Err(BrokerError::Connection("connection closed".into()));
        }

        Ok(serde_json::from_str(self.line_buffer.trim())?)
    }

    /// Close stdin and wait for the peer to exit, killing it after a
    /// grace period.
    pub async fn close(&mut self) -> Result<(), BrokerError> {
        self.connected = false;
        self.stdin.take();

        if let Some(mut child) = self.child.take() {
            tokio::select! {
                result = child.wait() => {
                    result.map_err(|e| BrokerError::Connection(e.to_string()))?;
                }
                _ = tokio::time::sleep(Duration::from_secs(5)) => {
                    child.kill().await.ok();
                }
            }
        }
        Ok(())
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
        }
    }
}
