//! One run: dispatching batches until every enumerated test has a verdict.
//!
//! The [`RunLoop`] keeps up to `workers` batch invocations in flight. Each
//! completed invocation is parsed and classified; trusted outcomes are
//! recorded, untrusted ones are split around their culprit and queued
//! ahead of everything else. A malformed batch of one test is a crash.
//!
//! Once the queue is drained every crash is re-run on its own with
//! `--gtest_repeat`. Tests that survive that are excluded for the rest of
//! the session instead of being reported as failures.
//!
//! All run state lives in the loop itself; the only concurrency is in the
//! pool's futures.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::RunResult;
use super::classify::{Classification, classify};
use super::pool::WorkerPool;
use super::scheduler::Scheduler;
use super::splitter::smart_split;
use crate::config::{SchedulerConfig, VerifyConfig};
use crate::framework::gtest::{GTestBinary, Invocation};
use crate::framework::results::ResultParser;
use crate::framework::{Batch, BatchOutcome, TestId, TestListing, TestVerdict, Verdict};
use crate::provider::{ExecResult, ProviderResult};
use crate::report::Reporter;

/// A batch invocation that has come back from the pool.
struct Dispatched {
    batch: Batch,
    invocation: Invocation,
    exec: ProviderResult<ExecResult>,
}

/// Verdicts and counters accumulated over one run.
#[derive(Default)]
struct RunState {
    verdicts: BTreeMap<TestId, TestVerdict>,
    crashes: Vec<TestVerdict>,
    malformed_batches: usize,
    classified_batches: usize,
}

impl RunState {
    fn record(&mut self, verdict: TestVerdict) {
        self.verdicts.insert(verdict.test.clone(), verdict);
    }
}

/// Executes a single run over an enumerated listing.
pub struct RunLoop<'a, W: ?Sized, R: ?Sized> {
    pool: &'a W,
    binary: &'a GTestBinary,
    reporter: &'a R,
    scheduler_config: SchedulerConfig,
    verify: VerifyConfig,
    parser: ResultParser,
    cancellation_token: Option<CancellationToken>,
}

impl<'a, W, R> RunLoop<'a, W, R>
where
    W: WorkerPool + ?Sized,
    R: Reporter + ?Sized,
{
    pub fn new(pool: &'a W, binary: &'a GTestBinary, reporter: &'a R) -> Self {
        Self {
            pool,
            binary,
            reporter,
            scheduler_config: SchedulerConfig::default(),
            verify: VerifyConfig::default(),
            parser: ResultParser::new(),
            cancellation_token: None,
        }
    }

    pub fn with_scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.scheduler_config = config;
        self
    }

    pub fn with_verify_config(mut self, config: VerifyConfig) -> Self {
        self.verify = config;
        self
    }

    /// Sets a token that stops dispatching new batches when cancelled.
    ///
    /// In-flight batches are still awaited and recorded.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = Some(token);
        self
    }

    /// Runs every test in `listing` and returns the run's verdicts.
    ///
    /// # Errors
    ///
    /// Fails when the pool itself fails or when the binary reports tests
    /// it was never asked to run.
    pub async fn run(&self, run_index: usize, listing: TestListing) -> Result<RunResult> {
        let start = Instant::now();
        let total_tests = listing.len();
        self.reporter.on_run_start(run_index, total_tests).await;

        let mut scheduler = Scheduler::new(
            self.pool.workers(),
            self.scheduler_config.clone(),
            listing.into_suites(),
        );
        let mut state = RunState::default();
        let mut in_flight = FuturesUnordered::new();
        let mut interrupted = false;

        loop {
            while !interrupted && in_flight.len() < self.pool.workers() {
                let Some(batch) = scheduler.next_batch() else {
                    break;
                };
                in_flight.push(self.dispatch(batch));
            }
            if in_flight.is_empty() {
                break;
            }

            let next = match (&self.cancellation_token, interrupted) {
                (Some(token), false) => select! {
                    _ = token.cancelled() => None,
                    next = in_flight.next() => Some(next),
                },
                _ => Some(in_flight.next().await),
            };
            let Some(next) = next else {
                warn!(
                    "Interrupted; waiting for {} in-flight batch(es)",
                    in_flight.len()
                );
                interrupted = true;
                continue;
            };
            let Some(done) = next else {
                break;
            };

            if let Err(e) = self.absorb(done, &mut scheduler, &mut state).await {
                while let Some(rest) = in_flight.next().await {
                    rest.invocation.cleanup().await;
                }
                return Err(e);
            }
        }

        let RunState {
            mut verdicts,
            crashes,
            malformed_batches,
            classified_batches,
        } = state;

        let mut crashed = BTreeSet::new();
        let mut runtime_excluded = BTreeSet::new();
        for crash in crashes {
            let test = crash.test.clone();
            verdicts.insert(test.clone(), crash);

            if interrupted {
                warn!("Skipping verification of {} after interrupt", test);
            } else if !self.verify.enabled {
                crashed.insert(test);
            } else if self.deep_verify(&test).await? {
                info!(
                    "{} passed {} isolated iteration(s); excluding it for this session",
                    test, self.verify.repeat
                );
                runtime_excluded.insert(test);
            } else {
                warn!("{} crashes on its own", test);
                crashed.insert(test);
            }
        }

        let failed = verdicts
            .values()
            .filter(|v| v.verdict == Verdict::Fail)
            .map(|v| v.test.clone())
            .collect();

        let result = RunResult {
            run_index,
            total_tests,
            verdicts,
            failed,
            crashed,
            runtime_excluded,
            malformed_batches,
            classified_batches,
            interrupted,
            duration: start.elapsed(),
        };
        self.reporter.on_run_complete(&result).await;

        Ok(result)
    }

    async fn dispatch(&self, batch: Batch) -> Dispatched {
        let invocation = self.binary.batch_invocation(&batch);
        debug!(
            "Dispatching batch of {} test(s) in {} suite(s)",
            batch.len(),
            batch.groups().len()
        );
        let exec = self.pool.run_async(&invocation.command).await;
        Dispatched {
            batch,
            invocation,
            exec,
        }
    }

    async fn outcome(&self, exec: &ExecResult, invocation: &Invocation) -> BatchOutcome {
        match self
            .parser
            .parse(exec, &invocation.result_path, &invocation.expected)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Unusable result file {}: {}", invocation.result_path.display(), e);
                self.parser.crash_outcome(exec, &invocation.expected)
            }
        }
    }

    async fn absorb(
        &self,
        done: Dispatched,
        scheduler: &mut Scheduler,
        state: &mut RunState,
    ) -> Result<()> {
        let Dispatched {
            batch,
            invocation,
            exec,
        } = done;

        let exec = match exec {
            Ok(exec) => exec,
            Err(e) => {
                invocation.cleanup().await;
                return Err(e).context("Worker pool failed");
            }
        };

        let mut outcome = self.outcome(&exec, &invocation).await;
        invocation.cleanup().await;

        let classification = classify(&mut outcome);
        scheduler.record_executed(batch.len());
        state.classified_batches += 1;

        let resolved = match &classification {
            Classification::Passed | Classification::Failed => {
                let resolved = outcome.verdicts.len();
                for verdict in outcome.verdicts.into_values() {
                    state.record(verdict);
                }
                resolved
            }
            Classification::Malformed { culprit, reason } => {
                scheduler.record_crash();
                state.malformed_batches += 1;

                let decided: BTreeSet<TestId> = outcome
                    .verdicts
                    .values()
                    .filter(|v| &v.test != culprit)
                    .filter(|v| matches!(v.verdict, Verdict::Pass | Verdict::Fail | Verdict::Skipped))
                    .map(|v| v.test.clone())
                    .collect();
                for test in &decided {
                    if let Some(verdict) = outcome.verdicts.remove(test) {
                        state.record(verdict);
                    }
                }

                if batch.is_singleton() {
                    warn!("{} crashed: {}", culprit, reason);
                    let crash = TestVerdict::new(culprit.clone(), Verdict::Crash)
                        .with_log(format!("{}\n{}", reason, tail(&exec.stderr, 20)))
                        .with_duration(exec.duration);
                    state.crashes.push(crash);
                    decided.len() + 1
                } else {
                    let parts = smart_split(&batch.without(&decided), culprit);
                    debug!(
                        "Batch of {} malformed ({}); blaming {}, requeued as {} part(s)",
                        batch.len(),
                        reason,
                        culprit,
                        parts.len()
                    );
                    scheduler.push_priority(parts);
                    decided.len()
                }
            }
            Classification::Protocol { unexpected } => {
                let names: Vec<String> = unexpected.iter().map(ToString::to_string).collect();
                bail!(
                    "Binary reported tests outside its filter: {}",
                    names.join(", ")
                );
            }
        };

        self.reporter
            .on_batch_complete(&batch, &classification, resolved)
            .await;
        Ok(())
    }

    /// Re-runs `test` alone with `--gtest_repeat`. True if every iteration passed.
    async fn deep_verify(&self, test: &TestId) -> Result<bool> {
        let invocation = self.binary.verify_invocation(test, self.verify.repeat);
        debug!("Verifying {} with {} iteration(s)", test, self.verify.repeat);

        let exec = match self.pool.run_sync(&invocation.command).await {
            Ok(exec) => exec,
            Err(e) => {
                invocation.cleanup().await;
                return Err(e).with_context(|| format!("Failed to verify {}", test));
            }
        };

        let mut outcome = self.outcome(&exec, &invocation).await;
        invocation.cleanup().await;

        Ok(classify(&mut outcome) == Classification::Passed)
    }
}

/// The last `lines` lines of `text`.
fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}
