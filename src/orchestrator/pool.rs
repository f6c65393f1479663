//! Worker pool: bounded, isolated execution of gtest invocations.
//!
//! The run controller only ever sees the [`WorkerPool`] trait. The
//! production implementation, [`SandboxWorkerPool`], keeps idle sandboxes
//! from a [`SandboxProvider`] in a [`SandboxPool`] and reuses them across
//! batches, creating new ones on demand up to the worker limit.
//!
//! # Invocation lifecycle
//!
//! ```text
//!   take idle sandbox ──► stage flag files ──► exec_stream ──► collect output
//!   (or create one)        (write + upload)        │           (with timeout)
//!                                                  ▼
//!                            download result XML ◄─┘
//!                                   │
//!               Ok: sandbox back to idle pool / Err: sandbox terminated
//! ```
//!
//! A timed-out invocation yields an [`ExecResult`] with `timed_out` set and
//! no result file, which the crash detector treats as a crash.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use crate::config::SandboxConfig;
use crate::connector::parse_json_result;
use crate::provider::{
    Command, ExecResult, OutputLine, ProviderError, ProviderResult, Sandbox, SandboxProvider,
};

/// Timeout applied to commands that do not carry one.
const DEFAULT_TIMEOUT_SECS: u64 = 3600;

/// Callback function for streaming invocation output.
///
/// Receives the id of the sandbox producing the line.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use gtest_sieve::orchestrator::OutputCallback;
/// use gtest_sieve::provider::OutputLine;
///
/// let callback: OutputCallback = Arc::new(|sandbox_id, line| {
///     match line {
///         OutputLine::Stdout(s) => println!("[{}] {}", sandbox_id, s),
///         OutputLine::Stderr(s) => eprintln!("[{}] {}", sandbox_id, s),
///         OutputLine::ExitCode(_) => {}
///     }
/// });
/// ```
pub type OutputCallback = Arc<dyn Fn(&str, &OutputLine) + Send + Sync>;

/// Capability the run controller needs from a pool of workers.
///
/// A non-zero exit is not an error; errors mean the pool itself failed and
/// are fatal to the current run.
#[async_trait]
pub trait WorkerPool: Send + Sync {
    /// Maximum number of concurrent `run_async` invocations.
    fn workers(&self) -> usize;

    /// Runs a helper command (enumeration, verification) to completion.
    ///
    /// Not counted against the worker limit; callers issue these while no
    /// batch is in flight.
    async fn run_sync(&self, cmd: &Command) -> ProviderResult<ExecResult>;

    /// Runs a batch invocation, waiting for a free worker first.
    async fn run_async(&self, cmd: &Command) -> ProviderResult<ExecResult>;
}

/// A pool of reusable sandboxes.
///
/// Sandboxes go back into the pool after a clean invocation and are taken
/// out again for the next one.
pub struct SandboxPool<S: Sandbox> {
    sandboxes: Vec<S>,
}

impl<S: Sandbox> SandboxPool<S> {
    /// Creates a new empty sandbox pool.
    pub fn new() -> Self {
        Self {
            sandboxes: Vec::new(),
        }
    }

    /// Adds a sandbox to the pool.
    pub fn add(&mut self, sandbox: S) {
        self.sandboxes.push(sandbox);
    }

    /// Takes one sandbox from the pool, if available.
    pub fn take_one(&mut self) -> Option<S> {
        self.sandboxes.pop()
    }

    /// Returns the number of available sandboxes in the pool.
    pub fn len(&self) -> usize {
        self.sandboxes.len()
    }

    /// Returns true if the pool has no sandboxes.
    pub fn is_empty(&self) -> bool {
        self.sandboxes.is_empty()
    }

    /// Terminates all sandboxes in the pool.
    ///
    /// Errors during termination are logged but don't prevent other
    /// sandboxes from being terminated.
    pub async fn terminate_all(&mut self) {
        for sandbox in self.sandboxes.drain(..) {
            if let Err(e) = sandbox.terminate().await {
                warn!("Failed to terminate sandbox {}: {}", sandbox.id(), e);
            }
        }
    }
}

impl<S: Sandbox> Default for SandboxPool<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// [`WorkerPool`] backed by sandboxes from a provider.
pub struct SandboxWorkerPool<P: SandboxProvider> {
    provider: P,
    idle: Mutex<SandboxPool<P::Sandbox>>,
    permits: Semaphore,
    workers: usize,
    working_dir: Option<String>,
    output_callback: Option<OutputCallback>,
    json_protocol: bool,
}

impl<P: SandboxProvider> SandboxWorkerPool<P> {
    /// Creates a pool running at most `workers` batches at once.
    pub fn new(provider: P, workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            provider,
            idle: Mutex::new(SandboxPool::new()),
            permits: Semaphore::new(workers),
            workers,
            working_dir: None,
            output_callback: None,
            json_protocol: false,
        }
    }

    /// Working directory requested for every new sandbox.
    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Sets a callback receiving every output line as it arrives.
    pub fn with_output_callback(mut self, callback: OutputCallback) -> Self {
        self.output_callback = Some(callback);
        self
    }

    /// Reads the exit code from a trailing JSON line on stdout, as the
    /// default provider's exec scripts report it.
    pub fn with_json_protocol(mut self, enabled: bool) -> Self {
        self.json_protocol = enabled;
        self
    }

    /// Number of idle sandboxes kept for reuse.
    pub async fn idle_sandboxes(&self) -> usize {
        self.idle.lock().await.len()
    }

    /// Terminates every idle sandbox.
    pub async fn shutdown(&self) {
        self.idle.lock().await.terminate_all().await;
    }

    async fn acquire(&self) -> ProviderResult<P::Sandbox> {
        if let Some(sandbox) = self.idle.lock().await.take_one() {
            return Ok(sandbox);
        }

        let config = SandboxConfig {
            id: format!("sieve-{}", uuid::Uuid::new_v4()),
            working_dir: self.working_dir.clone(),
            env: Vec::new(),
        };
        self.provider.create_sandbox(&config).await
    }

    async fn execute(&self, cmd: &Command) -> ProviderResult<ExecResult> {
        let sandbox = self.acquire().await?;
        let result = self.exec_in(&sandbox, cmd).await;

        match &result {
            Ok(_) => self.idle.lock().await.add(sandbox),
            Err(e) => {
                warn!("Sandbox {} failed, discarding it: {}", sandbox.id(), e);
                if let Err(e) = sandbox.terminate().await {
                    warn!("Failed to terminate sandbox {}: {}", sandbox.id(), e);
                }
            }
        }

        result
    }

    async fn exec_in(&self, sandbox: &P::Sandbox, cmd: &Command) -> ProviderResult<ExecResult> {
        for staged in &cmd.staged_files {
            if let Some(parent) = staged.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&staged.path, &staged.contents).await?;
            sandbox.upload(&staged.path, &staged.path).await?;
        }

        if let Some(result_file) = &cmd.result_file {
            if let Some(parent) = result_file.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            // A leftover file would be mistaken for this invocation's output.
            let _ = tokio::fs::remove_file(result_file).await;
        }

        let start = Instant::now();
        let timeout = Duration::from_secs(cmd.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS));
        let mut stream = sandbox.exec_stream(cmd).await?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut exit_code = None;

        let collect = async {
            while let Some(line) = stream.next().await {
                if let Some(ref callback) = self.output_callback {
                    callback(sandbox.id(), &line);
                }
                match line {
                    OutputLine::Stdout(s) => {
                        stdout.push_str(&s);
                        stdout.push('\n');
                    }
                    OutputLine::Stderr(s) => {
                        stderr.push_str(&s);
                        stderr.push('\n');
                    }
                    OutputLine::ExitCode(code) => exit_code = Some(code),
                }
            }
        };
        let timed_out = tokio::time::timeout(timeout, collect).await.is_err();
        drop(stream);

        if timed_out {
            warn!(
                "Command timed out after {}s on {}: {}",
                timeout.as_secs(),
                sandbox.id(),
                cmd.program
            );
            if let Some(result_file) = &cmd.result_file {
                let _ = tokio::fs::remove_file(result_file).await;
            }
            return Ok(ExecResult {
                exit_code: -1,
                stdout,
                stderr,
                duration: start.elapsed(),
                timed_out: true,
            });
        }

        if let Some(result_file) = &cmd.result_file {
            let pair = [(result_file.as_path(), result_file.as_path())];
            if let Err(e) = sandbox.download(&pair).await {
                debug!(
                    "No result file fetched from {} ({}): {}",
                    sandbox.id(),
                    result_file.display(),
                    e
                );
            }
        }

        if self.json_protocol
            && let Some(parsed) = parse_json_result(&stdout)
        {
            return Ok(ExecResult {
                exit_code: parsed.exit_code,
                stdout: parsed.stdout,
                stderr: parsed.stderr,
                duration: start.elapsed(),
                timed_out: false,
            });
        }

        Ok(ExecResult {
            exit_code: exit_code.unwrap_or(-1),
            stdout,
            stderr,
            duration: start.elapsed(),
            timed_out: false,
        })
    }
}

#[async_trait]
impl<P: SandboxProvider> WorkerPool for SandboxWorkerPool<P> {
    fn workers(&self) -> usize {
        self.workers
    }

    async fn run_sync(&self, cmd: &Command) -> ProviderResult<ExecResult> {
        self.execute(cmd).await
    }

    async fn run_async(&self, cmd: &Command) -> ProviderResult<ExecResult> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| ProviderError::ExecFailed(e.to_string()))?;
        self.execute(cmd).await
    }
}
