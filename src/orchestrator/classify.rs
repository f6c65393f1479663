//! Crash detection: deciding whether a batch outcome can be trusted.
//!
//! A batch is well-formed when the result file accounts for every expected
//! test and the exit code agrees with the verdicts. Anything else means the
//! process died, hung, or misbehaved, and a single test is blamed.
//!
//! # Checks, in order
//!
//! | Condition | Classification | Culprit |
//! |-----------|----------------|---------|
//! | result file names tests never requested | [`Classification::Protocol`] | none |
//! | no result file | `Malformed(Crashed)` | last running, else first expected |
//! | some expected tests missing from file | `Malformed(MissingResults)` | last running, else first missing |
//! | non-zero exit but no failing test | `Malformed(ExitMismatch)` | last running, else first expected |
//! | at least one failing test | [`Classification::Failed`] | none |
//! | otherwise | [`Classification::Passed`] | none |
//!
//! "Last running" only counts when it names a test of the batch.

use std::fmt;

use crate::framework::{BatchOutcome, TestId};

/// Why a batch outcome was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MalformedReason {
    /// No usable result file.
    Crashed,
    /// The result file lacks some expected tests.
    MissingResults { missing: usize },
    /// The binary exited non-zero although every reported test passed.
    ExitMismatch { exit_code: i32 },
}

impl fmt::Display for MalformedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MalformedReason::Crashed => write!(f, "no result file"),
            MalformedReason::MissingResults { missing } => {
                write!(f, "{} test(s) missing from result file", missing)
            }
            MalformedReason::ExitMismatch { exit_code } => {
                write!(f, "exit code {} with no failing test", exit_code)
            }
        }
    }
}

/// The crash detector's judgement of one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Every test ran and passed (skips included).
    Passed,
    /// Every test ran, at least one failed.
    Failed,
    /// The outcome cannot be trusted; `culprit` is blamed.
    Malformed {
        culprit: TestId,
        reason: MalformedReason,
    },
    /// The binary reported tests it was never asked to run.
    Protocol { unexpected: Vec<TestId> },
}

impl Classification {
    /// Returns true for `Passed` and `Failed`.
    pub fn is_well_formed(&self) -> bool {
        matches!(self, Classification::Passed | Classification::Failed)
    }
}

/// Classifies an outcome and records the result in `outcome.well_formed`.
pub fn classify(outcome: &mut BatchOutcome) -> Classification {
    let classification = judge(outcome);
    outcome.well_formed = classification.is_well_formed();
    classification
}

fn judge(outcome: &BatchOutcome) -> Classification {
    if !outcome.unexpected.is_empty() {
        return Classification::Protocol {
            unexpected: outcome.unexpected.clone(),
        };
    }

    let Some(first_expected) = outcome.expected.first().cloned() else {
        return Classification::Passed;
    };

    let last_running = outcome
        .last_running
        .as_ref()
        .filter(|t| outcome.expected.contains(*t))
        .cloned();

    if !outcome.result_file_present {
        return Classification::Malformed {
            culprit: last_running.unwrap_or(first_expected),
            reason: MalformedReason::Crashed,
        };
    }

    let missing = outcome.missing();
    if let Some(first_missing) = missing.first() {
        return Classification::Malformed {
            culprit: last_running.unwrap_or_else(|| first_missing.clone()),
            reason: MalformedReason::MissingResults {
                missing: missing.len(),
            },
        };
    }

    let has_failures = !outcome.failures().is_empty();
    if !outcome.exit_passed() && !has_failures {
        return Classification::Malformed {
            culprit: last_running.unwrap_or(first_expected),
            reason: MalformedReason::ExitMismatch {
                exit_code: outcome.exit_code,
            },
        };
    }

    if has_failures {
        Classification::Failed
    } else {
        Classification::Passed
    }
}
