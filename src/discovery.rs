//! Test enumeration.
//!
//! Runs the binary with `--gtest_list_tests` through the worker pool and
//! parses the listing into suite groups. Persisted filter entries are
//! passed as a negative filter, so filtered tests never show up.
//!
//! Enumeration is retried a bounded number of times: a failure to list the
//! tests means nothing else in the run can proceed.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::framework::TestListing;
use crate::framework::gtest::{GTestBinary, parse_test_list};
use crate::orchestrator::WorkerPool;

/// Result type for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Errors that can occur during test enumeration.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// Every attempt failed; carries the last failure.
    #[error("Failed to enumerate tests after {attempts} attempt(s): {last_error}")]
    Exhausted { attempts: usize, last_error: String },
}

/// Lists the tests a gtest binary exposes.
pub struct TestEnumerator {
    binary: GTestBinary,
    attempts: usize,
    retry_delay: Duration,
}

impl TestEnumerator {
    /// Creates an enumerator making up to `attempts` tries (at least one).
    pub fn new(binary: GTestBinary, attempts: usize) -> Self {
        Self {
            binary,
            attempts: attempts.max(1),
            retry_delay: Duration::from_secs(1),
        }
    }

    /// Pause between failed attempts.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Enumerates tests, excluding the given filter entries.
    ///
    /// A non-zero exit or a pool error counts as a failed attempt. A
    /// successful run that lists nothing is a valid, empty listing.
    pub async fn enumerate<W: WorkerPool + ?Sized>(
        &self,
        pool: &W,
        exclusions: &[String],
    ) -> DiscoveryResult<TestListing> {
        let cmd = self.binary.list_command(exclusions);
        let mut last_error = String::new();

        for attempt in 1..=self.attempts {
            debug!("Enumerating tests (attempt {}/{})", attempt, self.attempts);

            let result = pool.run_sync(&cmd).await;
            for staged in &cmd.staged_files {
                let _ = tokio::fs::remove_file(&staged.path).await;
            }

            match result {
                Ok(exec) if exec.success() => {
                    let listing = parse_test_list(&exec.stdout);
                    info!(
                        "Enumerated {} tests in {} suites",
                        listing.len(),
                        listing.suites().len()
                    );
                    return Ok(listing);
                }
                Ok(exec) => {
                    last_error = if exec.timed_out {
                        "listing timed out".to_string()
                    } else {
                        format!(
                            "listing exited with code {}: {}",
                            exec.exit_code,
                            exec.stderr.trim()
                        )
                    };
                }
                Err(e) => last_error = e.to_string(),
            }

            warn!("Enumeration attempt {} failed: {}", attempt, last_error);
            if attempt < self.attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        Err(DiscoveryError::Exhausted {
            attempts: self.attempts,
            last_error,
        })
    }
}
