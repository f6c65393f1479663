//! Run control: repeated runs until the suite is stable.
//!
//! A session is a sequence of runs. Each run enumerates the binary under
//! the current exclusions, executes every listed test through the worker
//! pool and persists the failures it confirmed. The session ends once
//! enough consecutive runs pass, or when the run budget is spent.
//!
//! # Architecture
//!
//! ```text
//!   filter file ──► exclusions ──► TestEnumerator ──► TestListing
//!        ▲               ▲                                │
//!        │               │ runtime exclusions             ▼
//!        │               │                    RunLoop ◄── Scheduler
//!        │               │                      │  ▲          ▲
//!        │               │                      │  │ split    │ priority
//!        │               │              WorkerPool │          │
//!        │               │                      │  │          │
//!        │               │                      ▼  │          │
//!        │               │     ResultParser ──► classify ─────┘
//!        │               │                      │
//!        │               └──── deep verify ◄────┤ singleton crashes
//!        │                                      ▼
//!        └──────── update_condensed ◄──────── RunResult
//! ```
//!
//! # Key Components
//!
//! - [`Orchestrator`]: the multi-run loop
//! - [`RunLoop`]: one run over an enumerated listing
//! - [`Scheduler`]: adaptive batch sizing and priority requeueing
//! - [`classify`](classify::classify): decides whether a batch outcome is trustworthy
//! - [`smart_split`]: breaks an untrusted batch up around its culprit
//! - [`WorkerPool`]: where invocations actually run
//!
//! # Example
//!
//! ```no_run
//! use gtest_sieve::config::load_config;
//! use gtest_sieve::orchestrator::{Orchestrator, SandboxWorkerPool};
//! use gtest_sieve::provider::local::LocalProvider;
//! use gtest_sieve::report::NullReporter;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("sieve.toml"))?;
//!
//!     let provider = LocalProvider::new(Default::default());
//!     let pool = SandboxWorkerPool::new(provider, config.sieve.workers);
//!
//!     let orchestrator = Orchestrator::new(config, pool, NullReporter);
//!     let session = orchestrator.run().await?;
//!
//!     std::process::exit(session.exit_code());
//! }
//! ```

pub mod classify;
pub mod pool;
pub mod runner;
pub mod scheduler;
pub mod splitter;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::discovery::TestEnumerator;
use crate::filter::{self, UpdateMode};
use crate::framework::gtest::GTestBinary;
use crate::framework::{TestId, TestVerdict, Verdict};
use crate::report::Reporter;

pub use classify::{Classification, MalformedReason};
pub use pool::{OutputCallback, SandboxPool, SandboxWorkerPool, WorkerPool};
pub use runner::RunLoop;
pub use scheduler::Scheduler;
pub use splitter::smart_split;

/// Results of a single run.
///
/// A run passes only if every batch could be trusted and no test failed or
/// crashed. Tests that crashed in a batch but passed on their own still
/// fail the run they were found in.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// 1-based index of the run within the session.
    pub run_index: usize,

    /// Number of tests enumerated for this run.
    pub total_tests: usize,

    /// Final verdict per test that got one.
    pub verdicts: BTreeMap<TestId, TestVerdict>,

    /// Tests whose result file reported a failure.
    pub failed: BTreeSet<TestId>,

    /// Tests that crashed alone and failed deep verification.
    pub crashed: BTreeSet<TestId>,

    /// Tests that crashed alone but passed deep verification.
    pub runtime_excluded: BTreeSet<TestId>,

    /// Batches whose outcome could not be trusted.
    pub malformed_batches: usize,

    /// Batches that went through classification.
    pub classified_batches: usize,

    /// The run was cut short by an interrupt.
    pub interrupted: bool,

    /// Wall-clock duration of the run.
    pub duration: Duration,
}

impl RunResult {
    /// Returns `true` if the run counts towards the flake-free streak.
    pub fn success(&self) -> bool {
        !self.interrupted
            && self.failed.is_empty()
            && self.crashed.is_empty()
            && self.runtime_excluded.is_empty()
            && self.malformed_batches == 0
    }

    /// Failures to be written to the filter file.
    pub fn persistent_failures(&self) -> BTreeSet<TestId> {
        self.failed.union(&self.crashed).cloned().collect()
    }

    /// Number of tests with the given verdict.
    pub fn count(&self, verdict: Verdict) -> usize {
        self.verdicts
            .values()
            .filter(|v| v.verdict == verdict)
            .count()
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The flake-free target was reached.
    Succeeded,
    /// Every allowed run was used without reaching the target.
    Exhausted,
    /// The user interrupted the session.
    Interrupted,
}

/// Results of a whole session.
///
/// # Exit Codes
///
/// | Code | Meaning |
/// |------|---------|
/// | 0 | Flake-free target reached |
/// | 1 | Runs exhausted |
/// | 130 | Interrupted |
#[derive(Debug, Clone)]
pub struct SessionResult {
    pub outcome: SessionOutcome,

    /// Every run, in order.
    pub runs: Vec<RunResult>,

    /// Tests excluded for this session only.
    pub runtime_excluded: BTreeSet<TestId>,

    /// Number of times the filter file was rewritten.
    pub filter_updates: usize,

    /// Wall-clock duration of the session.
    pub duration: Duration,
}

impl SessionResult {
    /// Returns `true` if the flake-free target was reached.
    pub fn success(&self) -> bool {
        self.outcome == SessionOutcome::Succeeded
    }

    /// The last run, if any run started.
    pub fn last_run(&self) -> Option<&RunResult> {
        self.runs.last()
    }

    /// Returns an appropriate process exit code for this session.
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            SessionOutcome::Succeeded => 0,
            SessionOutcome::Exhausted => 1,
            SessionOutcome::Interrupted => 130,
        }
    }
}

/// The top-level controller.
///
/// Ties together a [`WorkerPool`] for execution and a [`Reporter`] for
/// output, and owns the filter file for the duration of the session.
pub struct Orchestrator<W, R> {
    config: Config,
    pool: W,
    reporter: R,
    binary: GTestBinary,
    filter_path: PathBuf,
    reset_filter: bool,
    cancellation_token: Option<CancellationToken>,
}

impl<W, R> Orchestrator<W, R>
where
    W: WorkerPool,
    R: Reporter,
{
    /// Creates an orchestrator for the binary named in `config`.
    pub fn new(config: Config, pool: W, reporter: R) -> Self {
        let binary = GTestBinary::from_config(&config.sieve);
        let filter_path = config.sieve.filter_file();
        Self {
            config,
            pool,
            reporter,
            binary,
            filter_path,
            reset_filter: false,
            cancellation_token: None,
        }
    }

    /// Ignores the existing filter file until the session first writes it,
    /// and makes that first write replace its contents.
    pub fn with_reset_filter(mut self, reset: bool) -> Self {
        self.reset_filter = reset;
        self
    }

    /// Sets a token that interrupts the session when cancelled.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = Some(token);
        self
    }

    /// The worker pool, e.g. for shutting it down afterwards.
    pub fn pool(&self) -> &W {
        &self.pool
    }

    /// Path of the filter file this session maintains.
    pub fn filter_path(&self) -> &Path {
        &self.filter_path
    }

    /// Runs the session.
    ///
    /// # Errors
    ///
    /// Returns an error if enumeration is exhausted, the pool fails, the
    /// filter file cannot be read or written, or the binary reports tests
    /// outside its filter.
    pub async fn run(&self) -> Result<SessionResult> {
        let start = Instant::now();
        let sieve = &self.config.sieve;

        let enumerator = TestEnumerator::new(self.binary.clone(), sieve.enumerate_attempts);
        let mut run_loop = RunLoop::new(&self.pool, &self.binary, &self.reporter)
            .with_scheduler_config(self.config.scheduler.clone())
            .with_verify_config(self.config.verify.clone());
        if let Some(token) = &self.cancellation_token {
            run_loop = run_loop.with_cancellation_token(token.clone());
        }

        let mut runs = Vec::new();
        let mut runtime_excluded: BTreeSet<TestId> = BTreeSet::new();
        let mut reset_pending = self.reset_filter;
        let mut filter_updates = 0;
        let mut flake_free = 0;
        let mut outcome = SessionOutcome::Exhausted;

        for run_index in 1..=sieve.max_runs {
            if self.is_cancelled() {
                outcome = SessionOutcome::Interrupted;
                break;
            }

            let persisted = if reset_pending {
                BTreeSet::new()
            } else {
                filter::load(&self.filter_path)?
            };
            let mut exclusions: Vec<String> = persisted.into_iter().collect();
            exclusions.extend(runtime_excluded.iter().map(ToString::to_string));

            info!(
                "Run {}/{}: enumerating {} ({} exclusion(s))",
                run_index,
                sieve.max_runs,
                self.binary.binary(),
                exclusions.len()
            );
            let listing = enumerator
                .enumerate(&self.pool, &exclusions)
                .await
                .context("Test enumeration failed")?;

            let result = run_loop.run(run_index, listing).await?;
            runtime_excluded.extend(result.runtime_excluded.iter().cloned());

            let failures = result.persistent_failures();
            if !failures.is_empty() && result.classified_batches > 0 {
                let known = enumerator
                    .enumerate(&self.pool, &[])
                    .await
                    .context("Unfiltered enumeration failed")?;
                let mode = if reset_pending {
                    UpdateMode::Replace
                } else {
                    UpdateMode::Append
                };
                if filter::update_condensed(&self.filter_path, &known, &failures, mode)? {
                    filter_updates += 1;
                }
                reset_pending = false;
            }

            let interrupted = result.interrupted;
            if result.success() {
                flake_free += 1;
                info!(
                    "Run {} passed ({}/{} consecutive)",
                    run_index, flake_free, sieve.flake_free_target
                );
            } else {
                flake_free = 0;
                warn!(
                    "Run {} failed: {} failed, {} crashed, {} excluded for this session",
                    run_index,
                    result.failed.len(),
                    result.crashed.len(),
                    result.runtime_excluded.len()
                );
            }
            runs.push(result);

            if interrupted {
                outcome = SessionOutcome::Interrupted;
                break;
            }
            if flake_free >= sieve.flake_free_target {
                outcome = SessionOutcome::Succeeded;
                break;
            }
        }

        Ok(SessionResult {
            outcome,
            runs,
            runtime_excluded,
            filter_updates,
            duration: start.elapsed(),
        })
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation_token
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }
}
