//! Local process provider implementation.
//!
//! Runs each gtest invocation as a child process of the sieve itself. This
//! is the default provider and what most users want: the binary, its flag
//! files and its XML output all live on the local filesystem.
//!
//! # Characteristics
//!
//! | Feature | Support |
//! |---------|---------|
//! | Isolation | None (shared filesystem and network) |
//! | File transfer | Local copy operations, no-op when paths coincide |
//! | Streaming output | Supported |
//! | Timeout kill | Child is killed when its output stream is dropped |
//!
//! # Example Configuration
//!
//! ```toml
//! [provider]
//! type = "local"
//! working_dir = "/path/to/build"
//! shell = "/bin/bash"
//!
//! [provider.env]
//! ASAN_OPTIONS = "detect_leaks=0"
//! ```

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};

use super::{
    Command, OutputLine, OutputStream, ProviderError, ProviderResult, Sandbox, SandboxProvider,
};
use crate::config::{LocalProviderConfig, SandboxConfig};

/// Provider that runs commands as local child processes.
pub struct LocalProvider {
    config: LocalProviderConfig,
}

impl LocalProvider {
    /// Creates a new local provider with the given configuration.
    ///
    /// ```
    /// use gtest_sieve::provider::local::LocalProvider;
    /// use gtest_sieve::config::LocalProviderConfig;
    ///
    /// let provider = LocalProvider::new(LocalProviderConfig::default());
    /// ```
    pub fn new(config: LocalProviderConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SandboxProvider for LocalProvider {
    type Sandbox = LocalSandbox;

    async fn create_sandbox(&self, config: &SandboxConfig) -> ProviderResult<LocalSandbox> {
        let working_dir = config
            .working_dir
            .as_ref()
            .map(PathBuf::from)
            .or_else(|| self.config.working_dir.clone())
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        let mut env = self.base_env();
        env.extend(config.env.iter().cloned());

        Ok(LocalSandbox {
            id: config.id.clone(),
            working_dir,
            env,
            shell: self.config.shell.clone(),
        })
    }

    fn base_env(&self) -> Vec<(String, String)> {
        let mut env: Vec<_> = self
            .config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.sort();
        env
    }
}

/// A sandbox that runs commands as local child processes.
///
/// Each command is executed via the configured shell (default: `/bin/sh`).
/// The child is spawned with `kill_on_drop`, so dropping the output stream
/// after a timeout kills a hung test binary.
pub struct LocalSandbox {
    id: String,
    working_dir: PathBuf,
    env: Vec<(String, String)>,
    shell: String,
}

impl LocalSandbox {
    fn resolve(&self, path: &Path) -> PathBuf {
        self.working_dir.join(path)
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn exec_stream(&self, cmd: &Command) -> ProviderResult<OutputStream> {
        let shell_cmd = cmd.to_shell_string();

        let mut process = tokio::process::Command::new(&self.shell);
        process.arg("-c").arg(&shell_cmd);
        process.current_dir(&self.working_dir);

        for (key, value) in &self.env {
            process.env(key, value);
        }
        for (key, value) in &cmd.env {
            process.env(key, value);
        }

        if let Some(dir) = &cmd.working_dir {
            process.current_dir(dir);
        }

        process.stdin(Stdio::null());
        process.stdout(Stdio::piped());
        process.stderr(Stdio::piped());
        process.kill_on_drop(true);

        let mut child = process
            .spawn()
            .map_err(|e| ProviderError::ExecFailed(e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProviderError::ExecFailed("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ProviderError::ExecFailed("stderr not captured".to_string()))?;

        let stdout_stream =
            tokio_stream::wrappers::LinesStream::new(BufReader::new(stdout).lines()).map(
                |line: Result<String, std::io::Error>| OutputLine::Stdout(line.unwrap_or_default()),
            );

        let stderr_stream =
            tokio_stream::wrappers::LinesStream::new(BufReader::new(stderr).lines()).map(
                |line: Result<String, std::io::Error>| OutputLine::Stderr(line.unwrap_or_default()),
            );

        // Exit code is reported once both pipes have closed.
        let exit = stream::once(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(_) => -1,
            };
            OutputLine::ExitCode(code)
        });

        let combined = stream::select(stdout_stream, stderr_stream).chain(exit);

        Ok(Box::pin(combined))
    }

    async fn upload(&self, local: &Path, remote: &Path) -> ProviderResult<()> {
        let dest = self.resolve(remote);
        if dest == local {
            return Ok(());
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ProviderError::UploadFailed(e.to_string()))?;
        }

        tokio::fs::copy(local, &dest)
            .await
            .map_err(|e| ProviderError::UploadFailed(e.to_string()))?;

        Ok(())
    }

    async fn download(&self, paths: &[(&Path, &Path)]) -> ProviderResult<()> {
        for (remote, local) in paths {
            let src = self.resolve(remote);
            if src == *local {
                continue;
            }

            if let Some(parent) = local.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| ProviderError::DownloadFailed(e.to_string()))?;
            }

            tokio::fs::copy(&src, local)
                .await
                .map_err(|e| ProviderError::DownloadFailed(e.to_string()))?;
        }

        Ok(())
    }

    async fn terminate(&self) -> ProviderResult<()> {
        // Process sandboxes don't need explicit cleanup
        Ok(())
    }
}
