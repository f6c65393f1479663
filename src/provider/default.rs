//! Default execution provider using lifecycle-based shell commands.
//!
//! This provider runs gtest invocations on workers managed by user-defined
//! shell commands: a VM pool, a container scheduler, a remote device farm.
//!
//! # Command Protocol
//!
//! | Template | Placeholders | Purpose |
//! |----------|--------------|---------|
//! | `create_command` | none | Creates a worker, prints its ID on stdout |
//! | `exec_command` | `{sandbox_id}`, `{command}` | Runs one gtest invocation |
//! | `destroy_command` | `{sandbox_id}` | Releases the worker |
//! | `upload_command` | `{sandbox_id}`, `{local}`, `{remote}` | Stages a flag file (optional) |
//! | `download_command` | `{sandbox_id}`, `{paths}` | Fetches result XML (optional) |
//!
//! The exec command may print `{"exit_code": N, ...}` as its final stdout
//! line to report the remote exit code (see [`crate::connector`]).
//!
//! Without `upload_command`/`download_command` the worker is assumed to
//! share the sieve's filesystem for flag and result files.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{Command, OutputStream, ProviderError, ProviderResult, Sandbox, SandboxProvider};
use crate::config::{DefaultProviderConfig, SandboxConfig};
use crate::connector::ShellConnector;

/// Provider that uses shell commands for sandbox lifecycle management.
pub struct DefaultProvider {
    connector: Arc<ShellConnector>,
    config: DefaultProviderConfig,
}

impl DefaultProvider {
    /// Creates a new provider from the given configuration.
    pub fn from_config(config: DefaultProviderConfig) -> Self {
        let mut connector = ShellConnector::new().with_timeout(config.timeout_secs);

        if let Some(dir) = &config.working_dir {
            connector = connector.with_working_dir(dir.clone());
        }

        Self {
            connector: Arc::new(connector),
            config,
        }
    }
}

#[async_trait]
impl SandboxProvider for DefaultProvider {
    type Sandbox = DefaultSandbox;

    async fn create_sandbox(&self, config: &SandboxConfig) -> ProviderResult<DefaultSandbox> {
        info!("Creating default sandbox: {}", config.id);

        let result = self.connector.run(&self.config.create_command).await?;

        if result.exit_code != 0 {
            return Err(ProviderError::CreateFailed(format!(
                "Create command failed: {}",
                result.stderr
            )));
        }

        let remote_id = result
            .stdout
            .lines()
            .last()
            .unwrap_or("")
            .trim()
            .to_string();
        if remote_id.is_empty() {
            return Err(ProviderError::CreateFailed(
                "Create command returned empty sandbox_id".to_string(),
            ));
        }

        info!("Created default sandbox with ID: {}", remote_id);

        Ok(DefaultSandbox {
            id: config.id.clone(),
            remote_id,
            connector: self.connector.clone(),
            exec_command: self.config.exec_command.clone(),
            destroy_command: self.config.destroy_command.clone(),
            upload_command: self.config.upload_command.clone(),
            download_command: self.config.download_command.clone(),
        })
    }
}

/// A sandbox managed through shell command templates.
///
/// The sandbox keeps the `remote_id` printed by the create command and
/// substitutes it into every other template. It is reused across batches.
pub struct DefaultSandbox {
    id: String,
    remote_id: String,
    connector: Arc<ShellConnector>,
    exec_command: String,
    destroy_command: String,
    upload_command: Option<String>,
    download_command: Option<String>,
}

impl DefaultSandbox {
    /// Build the exec command with substitutions.
    fn build_exec_command(&self, cmd: &Command) -> String {
        let mut inner_cmd = std::iter::once(cmd.program.as_str())
            .chain(cmd.args.iter().map(|s| s.as_str()))
            .map(|a| shell_words::quote(a).into_owned())
            .collect::<Vec<_>>()
            .join(" ");

        if !cmd.env.is_empty() {
            let assignments = cmd
                .env
                .iter()
                .map(|(k, v)| format!("{}={}", k, shell_words::quote(v)))
                .collect::<Vec<_>>()
                .join(" ");
            inner_cmd = format!("env {} {}", assignments, inner_cmd);
        }

        if let Some(dir) = &cmd.working_dir {
            inner_cmd = format!("cd {} && {}", shell_words::quote(dir), inner_cmd);
        }

        // Escape the entire command so it can be passed as a single shell argument
        let escaped_cmd = shell_words::quote(&inner_cmd);

        self.exec_command
            .replace("{sandbox_id}", &self.remote_id)
            .replace("{command}", &escaped_cmd)
    }

    fn build_destroy_command(&self) -> String {
        self.destroy_command.replace("{sandbox_id}", &self.remote_id)
    }

    fn build_upload_command(&self, local: &Path, remote: &Path) -> Option<String> {
        self.upload_command.as_ref().map(|cmd| {
            cmd.replace("{sandbox_id}", &self.remote_id)
                .replace("{local}", &shell_words::quote(&local.to_string_lossy()))
                .replace("{remote}", &shell_words::quote(&remote.to_string_lossy()))
        })
    }

    /// Build the download command with substitutions.
    ///
    /// `paths` holds (remote, local) pairs, rendered as `remote:local`.
    fn build_download_command(&self, paths: &[(String, String)]) -> Option<String> {
        self.download_command.as_ref().map(|cmd| {
            let paths_str = paths
                .iter()
                .map(|(remote, local)| {
                    format!(
                        "{}:{}",
                        shell_words::quote(remote),
                        shell_words::quote(local)
                    )
                })
                .collect::<Vec<_>>()
                .join(" ");

            cmd.replace("{sandbox_id}", &self.remote_id)
                .replace("{paths}", &paths_str)
        })
    }
}

#[async_trait]
impl Sandbox for DefaultSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn exec_stream(&self, cmd: &Command) -> ProviderResult<OutputStream> {
        let shell_cmd = self.build_exec_command(cmd);
        debug!("Streaming on {}: {}", self.remote_id, shell_cmd);
        self.connector.run_stream(&shell_cmd).await
    }

    async fn upload(&self, local: &Path, remote: &Path) -> ProviderResult<()> {
        let Some(shell_cmd) = self.build_upload_command(local, remote) else {
            return Ok(());
        };

        let result = self.connector.run(&shell_cmd).await?;
        if result.exit_code != 0 {
            return Err(ProviderError::UploadFailed(format!(
                "Upload command failed: {}",
                result.stderr
            )));
        }
        Ok(())
    }

    async fn download(&self, paths: &[(&Path, &Path)]) -> ProviderResult<()> {
        if paths.is_empty() {
            return Ok(());
        }

        let path_pairs: Vec<(String, String)> = paths
            .iter()
            .map(|(remote, local)| {
                (
                    remote.to_string_lossy().to_string(),
                    local.to_string_lossy().to_string(),
                )
            })
            .collect();

        let Some(shell_cmd) = self.build_download_command(&path_pairs) else {
            return Ok(());
        };

        debug!(
            "Downloading from {}: {} path(s)",
            self.remote_id,
            paths.len()
        );
        let result = self.connector.run(&shell_cmd).await?;

        if result.exit_code != 0 {
            return Err(ProviderError::DownloadFailed(format!(
                "Download command failed: {}",
                result.stderr
            )));
        }
        Ok(())
    }

    async fn terminate(&self) -> ProviderResult<()> {
        let shell_cmd = self.build_destroy_command();
        info!(
            "Terminating sandbox {} (remote: {})",
            self.id, self.remote_id
        );

        let result = self.connector.run(&shell_cmd).await?;

        if result.exit_code != 0 {
            warn!("Destroy command failed: {}", result.stderr);
        }

        Ok(())
    }
}
