//! Provider traits and implementations for sandbox execution environments.
//!
//! A sandbox is where a single gtest invocation runs. The worker pool in
//! [`crate::orchestrator::pool`] keeps a set of sandboxes alive and hands
//! each batch to one of them.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     SandboxProvider                          │
//! │  create_sandbox() ──────────► Sandbox                       │
//! └────────────────────────────────┼────────────────────────────┘
//!                                  ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Sandbox                               │
//! │  exec_stream(Command) ───► OutputStream (… , ExitCode)      │
//! │  upload(local, remote)     (flag files)                     │
//! │  download(remote, local)   (result XML)                     │
//! │  terminate()                                                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Built-in Providers
//!
//! | Provider | Module | Description |
//! |----------|--------|-------------|
//! | Local | [`local`] | Run the binary as local child processes |
//! | Default | [`default`] | Run the binary via custom shell commands |

pub mod default;
pub mod local;

use std::path::{Path, PathBuf};
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::config::SandboxConfig;

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors that can occur during provider operations.
///
/// A command that runs and exits non-zero is not an error. These variants
/// describe failures to run or to talk to the execution environment.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Failed to create a new sandbox instance.
    #[error("Failed to create sandbox: {0}")]
    CreateFailed(String),

    /// Failed to start a command or lost contact with it.
    #[error("Failed to execute command: {0}")]
    ExecFailed(String),

    /// Failed to upload a file to the sandbox.
    #[error("Failed to upload file: {0}")]
    UploadFailed(String),

    /// Failed to download a file from the sandbox.
    #[error("Failed to download file: {0}")]
    DownloadFailed(String),

    /// Operation timed out.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// I/O error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Provider-specific error not covered by other variants.
    #[error("Provider-specific error: {0}")]
    Other(#[from] anyhow::Error),
}

/// A file the worker must place in the sandbox before running a command.
///
/// The gtest runner passes long filters through `--gtest_flagfile`, so
/// every batch invocation carries one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    /// Path the command expects the file at.
    pub path: PathBuf,

    /// File contents.
    pub contents: String,
}

/// A command to execute in a sandbox.
///
/// Commands are built using a fluent builder API.
///
/// # Example
///
/// ```
/// use gtest_sieve::provider::Command;
///
/// let cmd = Command::new("./unit_tests")
///     .arg("--gtest_output=xml:/tmp/out.xml")
///     .args(["--gtest_color=no", "--gtest_brief=0"])
///     .working_dir("/build")
///     .env("GTEST_SHUFFLE", "0")
///     .timeout(600);
///
/// assert_eq!(cmd.program, "./unit_tests");
/// assert_eq!(cmd.args.len(), 3);
/// ```
#[derive(Debug, Clone)]
pub struct Command {
    /// The program/executable to run.
    pub program: String,

    /// Arguments to pass to the program.
    pub args: Vec<String>,

    /// Working directory for command execution.
    ///
    /// If `None`, uses the sandbox's default working directory.
    pub working_dir: Option<String>,

    /// Environment variables to set for this command.
    pub env: Vec<(String, String)>,

    /// Maximum execution time in seconds.
    pub timeout_secs: Option<u64>,

    /// Files written into the sandbox before the command starts.
    pub staged_files: Vec<StagedFile>,

    /// Structured result file the command produces, fetched back afterwards.
    pub result_file: Option<PathBuf>,
}

impl Command {
    /// Creates a new command with the given program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            timeout_secs: None,
            staged_files: Vec::new(),
            result_file: None,
        }
    }

    /// Adds a single argument to the command.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds multiple arguments to the command.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the working directory for command execution.
    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Adds an environment variable for this command.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets the execution timeout in seconds.
    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Stages a file into the sandbox before execution.
    pub fn stage(mut self, path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        self.staged_files.push(StagedFile {
            path: path.into(),
            contents: contents.into(),
        });
        self
    }

    /// Declares the result file the command writes.
    pub fn result_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.result_file = Some(path.into());
        self
    }

    /// Converts the command to a shell-executable string.
    ///
    /// ```
    /// use gtest_sieve::provider::Command;
    /// let cmd = Command::new("echo").arg("hello world");
    /// assert_eq!(cmd.to_shell_string(), "echo 'hello world'");
    /// ```
    pub fn to_shell_string(&self) -> String {
        let mut parts = vec![shell_escape(&self.program)];
        for arg in &self.args {
            parts.push(shell_escape(arg));
        }
        parts.join(" ")
    }
}

/// Result of executing a command in a sandbox.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    /// Exit code of the command.
    pub exit_code: i32,

    /// Captured standard output.
    pub stdout: String,

    /// Captured standard error.
    pub stderr: String,

    /// Wall-clock time the command took to execute.
    pub duration: std::time::Duration,

    /// The command was killed after exceeding its timeout.
    pub timed_out: bool,
}

impl ExecResult {
    /// Returns `true` if the command exited with code 0 within its timeout.
    ///
    /// ```
    /// use gtest_sieve::provider::ExecResult;
    ///
    /// let result = ExecResult { exit_code: 0, ..Default::default() };
    /// assert!(result.success());
    /// ```
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// A single line of output from a streaming command.
#[derive(Debug, Clone)]
pub enum OutputLine {
    /// A line from standard output.
    Stdout(String),
    /// A line from standard error.
    Stderr(String),
    /// The exit code of the command (yielded last, after all output).
    ExitCode(i32),
}

/// A stream of output lines from a command.
pub type OutputStream = Pin<Box<dyn Stream<Item = OutputLine> + Send>>;

/// An isolated execution environment for running commands.
///
/// Sandboxes are reused across batches, so implementations must leave no
/// per-command state behind.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Returns the unique identifier for this sandbox.
    fn id(&self) -> &str;

    /// Executes a command and streams output in real-time.
    ///
    /// Dropping the stream must stop the command.
    async fn exec_stream(&self, cmd: &Command) -> ProviderResult<OutputStream>;

    /// Uploads a local file to `remote` inside the sandbox.
    async fn upload(&self, local: &Path, remote: &Path) -> ProviderResult<()>;

    /// Downloads files from the sandbox.
    ///
    /// `paths` holds (remote, local) pairs.
    async fn download(&self, paths: &[(&Path, &Path)]) -> ProviderResult<()>;

    /// Terminates the sandbox and releases resources.
    ///
    /// Calling it more than once is safe.
    async fn terminate(&self) -> ProviderResult<()>;
}

/// Escape a string for use in a shell command.
fn shell_escape(s: &str) -> String {
    if !s.is_empty()
        && s.chars().all(|c| {
            c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | '=' | ':' | ',')
        })
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

/// Factory for creating sandbox instances.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// The concrete [`Sandbox`] type created by this provider.
    type Sandbox: Sandbox;

    /// Creates a new sandbox with the given configuration.
    ///
    /// # Errors
    ///
    /// - `ProviderError::CreateFailed` - Failed to create sandbox
    /// - `ProviderError::ExecFailed` - The lifecycle command could not run
    async fn create_sandbox(&self, config: &SandboxConfig) -> ProviderResult<Self::Sandbox>;

    /// Returns base environment variables from the provider configuration.
    fn base_env(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}
