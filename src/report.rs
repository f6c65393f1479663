//! Progress reporting and session summaries.
//!
//! Reporters receive events from the run loop. [`ConsoleReporter`] draws a
//! progress bar per run; [`junit::JUnitReporter`] writes the verdicts of
//! the most recent run as JUnit XML.

pub mod junit;

use async_trait::async_trait;

use crate::framework::{Batch, Verdict};
use crate::orchestrator::{Classification, RunResult, SessionOutcome, SessionResult};

pub use junit::JUnitReporter;

/// A reporter receives events during a session.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called once a run has its listing, before any batch is dispatched.
    async fn on_run_start(&self, run_index: usize, total_tests: usize);

    /// Called for every classified batch.
    ///
    /// `resolved` is the number of tests that got a final verdict from it.
    async fn on_batch_complete(
        &self,
        batch: &Batch,
        classification: &Classification,
        resolved: usize,
    );

    /// Called when a run has finished, including deep verification.
    async fn on_run_complete(&self, result: &RunResult);
}

/// A reporter that does nothing (for testing or when output is not needed).
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_run_start(&self, _run_index: usize, _total_tests: usize) {}
    async fn on_batch_complete(&self, _: &Batch, _: &Classification, _: usize) {}
    async fn on_run_complete(&self, _result: &RunResult) {}
}

/// A reporter that combines multiple reporters.
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    /// Create a new multi-reporter.
    pub fn new() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    /// Add a reporter to the multi-reporter.
    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }
}

impl Default for MultiReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_run_start(&self, run_index: usize, total_tests: usize) {
        for reporter in &self.reporters {
            reporter.on_run_start(run_index, total_tests).await;
        }
    }

    async fn on_batch_complete(
        &self,
        batch: &Batch,
        classification: &Classification,
        resolved: usize,
    ) {
        for reporter in &self.reporters {
            reporter
                .on_batch_complete(batch, classification, resolved)
                .await;
        }
    }

    async fn on_run_complete(&self, result: &RunResult) {
        for reporter in &self.reporters {
            reporter.on_run_complete(result).await;
        }
    }
}

/// Console reporter that shows progress in the terminal.
pub struct ConsoleReporter {
    progress: std::sync::Mutex<Option<indicatif::ProgressBar>>,
    verbose: bool,
}

impl ConsoleReporter {
    /// Create a new console reporter.
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: std::sync::Mutex::new(None),
            verbose,
        }
    }

    fn println(&self, line: String) {
        match self.progress.lock().ok().as_deref().and_then(Option::as_ref) {
            Some(pb) => pb.println(line),
            None => println!("{}", line),
        }
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_run_start(&self, run_index: usize, total_tests: usize) {
        println!("Run {}: {} tests", run_index, total_tests);

        let pb = indicatif::ProgressBar::new(total_tests as u64);
        if let Ok(style) = indicatif::ProgressStyle::default_bar().template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        ) {
            pb.set_style(style.progress_chars("#>-"));
        }

        if let Ok(mut progress) = self.progress.lock() {
            *progress = Some(pb);
        }
    }

    async fn on_batch_complete(
        &self,
        batch: &Batch,
        classification: &Classification,
        resolved: usize,
    ) {
        match classification {
            Classification::Malformed { culprit, reason } => {
                let label = if batch.is_singleton() {
                    console::style("CRASH").red().bold()
                } else {
                    console::style("SPLIT").yellow()
                };
                self.println(format!(
                    "{} {} ({}, batch of {})",
                    label,
                    culprit,
                    reason,
                    batch.len()
                ));
            }
            Classification::Failed if self.verbose => {
                self.println(format!(
                    "{} batch of {}",
                    console::style("FAIL ").red(),
                    batch.len()
                ));
            }
            Classification::Passed if self.verbose => {
                self.println(format!(
                    "{} batch of {}",
                    console::style("PASS ").green(),
                    batch.len()
                ));
            }
            _ => {}
        }

        if let Ok(progress) = self.progress.lock()
            && let Some(pb) = progress.as_ref()
        {
            pb.inc(resolved as u64);
        }
    }

    async fn on_run_complete(&self, result: &RunResult) {
        if let Ok(mut progress) = self.progress.lock()
            && let Some(pb) = progress.take()
        {
            pb.finish_and_clear();
        }

        println!();
        println!("Run {} results:", result.run_index);
        println!("  Total:    {}", result.total_tests);
        println!("  Passed:   {}", console::style(result.count(Verdict::Pass)).green());
        println!("  Failed:   {}", console::style(result.failed.len()).red());
        println!("  Crashed:  {}", console::style(result.crashed.len()).red());
        println!("  Skipped:  {}", console::style(result.count(Verdict::Skipped)).yellow());

        if !result.runtime_excluded.is_empty() {
            println!(
                "  Excluded: {} {}",
                console::style(result.runtime_excluded.len()).yellow(),
                console::style("(crashed in a batch, passed alone)").dim()
            );
        }
        if result.malformed_batches > 0 {
            println!("  Split:    {} batch(es)", result.malformed_batches);
        }
        println!("  Duration: {:?}", result.duration);

        for test in result.failed.iter().chain(&result.crashed) {
            println!("  - {}", test);
            if self.verbose
                && let Some(log) = result.verdicts.get(test).and_then(|v| v.log.as_ref())
            {
                for line in log.lines() {
                    println!("      {}", console::style(line).dim());
                }
            }
        }
    }
}

/// Prints a summary of the session to the console.
pub fn print_summary(session: &SessionResult) {
    println!();
    println!("Session:");
    println!("  Runs:           {}", session.runs.len());
    println!("  Filter updates: {}", session.filter_updates);

    if !session.runtime_excluded.is_empty() {
        println!(
            "  Excluded for this session only: {}",
            console::style(session.runtime_excluded.len()).yellow()
        );
        for test in &session.runtime_excluded {
            println!("    - {}", test);
        }
    }

    println!("  Duration:       {:?}", session.duration);
    println!();

    match session.outcome {
        SessionOutcome::Succeeded => {
            println!("{}", console::style("Suite is stable.").green().bold());
        }
        SessionOutcome::Exhausted => {
            println!(
                "{}",
                console::style("Run budget exhausted before the suite stabilised.")
                    .red()
                    .bold()
            );
        }
        SessionOutcome::Interrupted => {
            println!("{}", console::style("Interrupted.").yellow().bold());
        }
    }
}
