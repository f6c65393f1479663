//! Shell connector used by the default provider.
//!
//! The default provider drives remote workers through user-supplied shell
//! command templates. [`ShellConnector`] runs those commands locally via
//! `sh -c`, either to completion ([`run`](ShellConnector::run)) or as a
//! stream of output lines ([`run_stream`](ShellConnector::run_stream)).
//!
//! # Exit Code Protocol
//!
//! An exec command may report the remote exit code by printing a JSON
//! object as its last stdout line:
//!
//! ```json
//! {"exit_code": 0, "stdout": "...", "stderr": "..."}
//! ```
//!
//! [`parse_json_result`] recognises that line. Without it, the local exit
//! code of the connector process is used.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

use crate::provider::{OutputLine, OutputStream, ProviderError, ProviderResult};

/// Result from a connector execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Runs lifecycle and exec commands through the local shell.
#[derive(Debug, Clone)]
pub struct ShellConnector {
    shell: String,
    working_dir: Option<PathBuf>,
    timeout_secs: u64,
}

impl Default for ShellConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellConnector {
    pub fn new() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
            working_dir: None,
            timeout_secs: 3600,
        }
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    fn command(&self, shell_cmd: &str) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.shell);
        cmd.arg("-c").arg(shell_cmd);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    /// Runs a command to completion and captures its output.
    ///
    /// A JSON exit-code line on stdout takes precedence over the local exit
    /// status.
    pub async fn run(&self, shell_cmd: &str) -> ProviderResult<ConnectorResult> {
        debug!("Running command: {}", shell_cmd);

        let output = tokio::time::timeout(
            Duration::from_secs(self.timeout_secs),
            self.command(shell_cmd).output(),
        )
        .await
        .map_err(|_| ProviderError::Timeout(format!("Command timed out: {}", shell_cmd)))?
        .map_err(|e| ProviderError::ExecFailed(format!("Failed to run connector: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        match parse_json_result(&stdout) {
            Some(result) => Ok(result),
            None => Ok(ConnectorResult {
                exit_code: output.status.code().unwrap_or(-1),
                stdout,
                stderr,
            }),
        }
    }

    /// Spawns a command and streams its output.
    ///
    /// The stream ends with [`OutputLine::ExitCode`] carrying the local exit
    /// status. Dropping the stream kills the process.
    pub async fn run_stream(&self, shell_cmd: &str) -> ProviderResult<OutputStream> {
        debug!("Streaming command: {}", shell_cmd);

        let mut child = self
            .command(shell_cmd)
            .spawn()
            .map_err(|e| ProviderError::ExecFailed(format!("Failed to spawn connector: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProviderError::ExecFailed("Failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ProviderError::ExecFailed("Failed to capture stderr".to_string()))?;

        let stdout_stream = tokio_stream::wrappers::LinesStream::new(BufReader::new(stdout).lines())
            .map(|line| OutputLine::Stdout(line.unwrap_or_default()));

        let stderr_stream = tokio_stream::wrappers::LinesStream::new(BufReader::new(stderr).lines())
            .map(|line| OutputLine::Stderr(line.unwrap_or_default()));

        let exit = stream::once(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(_) => -1,
            };
            OutputLine::ExitCode(code)
        });

        Ok(Box::pin(
            stream::select(stdout_stream, stderr_stream).chain(exit),
        ))
    }
}

/// Finds the JSON exit-code line in connector stdout, searching from the end.
pub fn parse_json_result(stdout: &str) -> Option<ConnectorResult> {
    stdout
        .lines()
        .rev()
        .find(|line| line.trim().starts_with('{'))
        .and_then(|line| serde_json::from_str::<ConnectorResult>(line.trim()).ok())
}
