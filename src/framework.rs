//! Test identity, batches and verdicts.
//!
//! This module holds the data model shared by every stage of a sieve run:
//! how a GoogleTest test is named, how tests are grouped into suite-ordered
//! batches, and what a worker invocation is judged to have produced.
//!
//! # Data Model
//!
//! ```text
//!   TestListing ──► SuiteGroup* ──► Batch ──► (worker) ──► BatchOutcome
//!        │              │             │                        │
//!   suite order    leaf order    filter order           TestVerdict per test
//! ```
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`TestId`] | `SuitePrefix` (ending in `.`) plus leaf name |
//! | [`SuiteGroup`] | one suite and its leaves in enumeration order |
//! | [`Batch`] | ordered suite groups run by a single invocation |
//! | [`TestListing`] | everything the binary enumerated |
//! | [`BatchOutcome`] | what one invocation produced, before and after classification |
//!
//! The gtest-specific pieces (listing parser, command construction, result
//! XML parsing) live in [`gtest`] and [`results`].

pub mod gtest;
pub mod results;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

/// Result type for framework operations.
pub type FrameworkResult<T> = Result<T, FrameworkError>;

/// Errors raised while interpreting test binary output.
#[derive(Debug, thiserror::Error)]
pub enum FrameworkError {
    /// The structured result file exists but is not valid gtest XML.
    ///
    /// Callers treat this exactly like a missing result file.
    #[error("Failed to parse result file: {0}")]
    ParseError(String),

    /// The result file could not be read for a reason other than absence.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Identity of a single GoogleTest test.
///
/// The suite prefix always carries its trailing period, so the flat form is
/// simply `suite + name`:
///
/// ```
/// use gtest_sieve::framework::TestId;
///
/// let id = TestId::new("MathTest", "Adds");
/// assert_eq!(id.suite(), "MathTest.");
/// assert_eq!(id.to_string(), "MathTest.Adds");
///
/// let parsed = TestId::parse("Param/MathTest.Adds/3").unwrap();
/// assert_eq!(parsed.suite(), "Param/MathTest.");
/// assert_eq!(parsed.name(), "Adds/3");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TestId {
    suite: String,
    name: String,
}

impl TestId {
    /// Creates a test id. A missing trailing period on `suite` is added.
    pub fn new(suite: impl Into<String>, name: impl Into<String>) -> Self {
        let mut suite = suite.into();
        if !suite.ends_with('.') {
            suite.push('.');
        }
        Self {
            suite,
            name: name.into(),
        }
    }

    /// Parses the flat `Suite.Leaf` form.
    ///
    /// Suite names never contain a period, so the first one separates the
    /// prefix from the leaf. Returns `None` when either side is empty.
    pub fn parse(full_name: &str) -> Option<Self> {
        let (suite, name) = full_name.split_once('.')?;
        if suite.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(suite, name))
    }

    /// The suite prefix, including the trailing period.
    pub fn suite(&self) -> &str {
        &self.suite
    }

    /// The leaf (method) name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether gtest would skip this test unless disabled tests are requested.
    pub fn is_disabled(&self) -> bool {
        self.name.starts_with("DISABLED_")
            || self
                .suite
                .split('/')
                .any(|part| part.starts_with("DISABLED_"))
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.suite, self.name)
    }
}

/// A suite and its leaves, in enumeration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteGroup {
    /// Suite prefix, including the trailing period.
    pub suite: String,

    /// Leaf names in the order the binary listed them.
    pub names: Vec<String>,
}

impl SuiteGroup {
    /// Creates a group for `suite` with the given leaves.
    pub fn new<I, S>(suite: impl Into<String>, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut suite = suite.into();
        if !suite.ends_with('.') {
            suite.push('.');
        }
        Self {
            suite,
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Number of leaves in the group.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Returns true if the group has no leaves.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Iterates over the group's leaves as full test ids.
    pub fn tests(&self) -> impl Iterator<Item = TestId> + '_ {
        self.names
            .iter()
            .map(move |name| TestId::new(self.suite.clone(), name.clone()))
    }
}

/// An ordered set of tests dispatched to a single worker invocation.
///
/// Suite order is significant because the binary runs tests in filter order.
/// A suite appears at most once: pushing a test whose suite is already
/// present appends it to that suite's group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    groups: Vec<SuiteGroup>,
}

impl Batch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a batch from suite groups, merging repeated suites.
    pub fn from_groups(groups: impl IntoIterator<Item = SuiteGroup>) -> Self {
        let mut batch = Self::new();
        for group in groups {
            batch.push_group(group);
        }
        batch
    }

    /// Creates a batch from individual tests, preserving their order.
    pub fn from_tests<'a>(tests: impl IntoIterator<Item = &'a TestId>) -> Self {
        let mut batch = Self::new();
        for test in tests {
            batch.push(test.clone());
        }
        batch
    }

    /// A batch holding exactly one test.
    pub fn single(test: TestId) -> Self {
        let mut batch = Self::new();
        batch.push(test);
        batch
    }

    /// Appends a test, keeping each suite in a single group.
    pub fn push(&mut self, test: TestId) {
        match self.groups.iter_mut().find(|g| g.suite == test.suite) {
            Some(group) => group.names.push(test.name),
            None => self.groups.push(SuiteGroup {
                suite: test.suite,
                names: vec![test.name],
            }),
        }
    }

    /// Appends a whole suite group. Empty groups are ignored.
    pub fn push_group(&mut self, group: SuiteGroup) {
        if group.is_empty() {
            return;
        }
        match self.groups.iter_mut().find(|g| g.suite == group.suite) {
            Some(existing) => existing.names.extend(group.names),
            None => self.groups.push(group),
        }
    }

    /// The suite groups in dispatch order.
    pub fn groups(&self) -> &[SuiteGroup] {
        &self.groups
    }

    /// Total number of leaves.
    pub fn len(&self) -> usize {
        self.groups.iter().map(SuiteGroup::len).sum()
    }

    /// Returns true if the batch holds no tests.
    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(SuiteGroup::is_empty)
    }

    /// Returns true if the batch holds exactly one test.
    pub fn is_singleton(&self) -> bool {
        self.len() == 1
    }

    /// All tests in dispatch order.
    pub fn tests(&self) -> Vec<TestId> {
        self.groups.iter().flat_map(SuiteGroup::tests).collect()
    }

    /// Returns true if `test` is part of the batch.
    pub fn contains(&self, test: &TestId) -> bool {
        self.groups
            .iter()
            .any(|g| g.suite == test.suite && g.names.iter().any(|n| *n == test.name))
    }

    /// Returns a copy of the batch without the tests in `remove`.
    pub fn without(&self, remove: &BTreeSet<TestId>) -> Batch {
        Batch::from_tests(self.tests().iter().filter(|t| !remove.contains(*t)))
    }
}

/// Everything a test binary enumerated, grouped by suite in listing order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestListing {
    suites: Vec<SuiteGroup>,
}

impl TestListing {
    /// Creates a listing from suite groups.
    pub fn new(suites: Vec<SuiteGroup>) -> Self {
        Self { suites }
    }

    /// The suite groups in listing order.
    pub fn suites(&self) -> &[SuiteGroup] {
        &self.suites
    }

    /// Consumes the listing, returning its suite groups.
    pub fn into_suites(self) -> Vec<SuiteGroup> {
        self.suites
    }

    /// Total number of tests.
    pub fn len(&self) -> usize {
        self.suites.iter().map(SuiteGroup::len).sum()
    }

    /// Returns true if nothing was enumerated.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All tests in listing order.
    pub fn tests(&self) -> Vec<TestId> {
        self.suites.iter().flat_map(SuiteGroup::tests).collect()
    }

    /// The leaves of `suite` (with trailing period), if the suite is known.
    pub fn leaves(&self, suite: &str) -> Option<&[String]> {
        self.suites
            .iter()
            .find(|g| g.suite == suite)
            .map(|g| g.names.as_slice())
    }

    /// Returns true if the binary exposes `test`.
    pub fn contains(&self, test: &TestId) -> bool {
        self.leaves(test.suite())
            .is_some_and(|names| names.iter().any(|n| n == test.name()))
    }

    /// Returns the listing without the given tests. Emptied suites are dropped.
    pub fn without(&self, remove: &BTreeSet<TestId>) -> TestListing {
        let suites = self
            .suites
            .iter()
            .map(|group| SuiteGroup {
                suite: group.suite.clone(),
                names: group
                    .names
                    .iter()
                    .filter(|name| !remove.contains(&TestId::new(group.suite.clone(), *name)))
                    .cloned()
                    .collect(),
            })
            .filter(|group| !group.is_empty())
            .collect();
        TestListing { suites }
    }
}

/// Per-test verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    /// The test ran and passed.
    Pass,
    /// The test ran and reported a failure.
    Fail,
    /// The process died before the test reported a result.
    Crash,
    /// The test was skipped or not run by the binary.
    Skipped,
    /// No information is available.
    Unknown,
}

impl Verdict {
    /// Returns true for `Fail` and `Crash`.
    pub fn is_failure(&self) -> bool {
        matches!(self, Verdict::Fail | Verdict::Crash)
    }

    /// Short label used in logs and reports.
    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Pass => "PASS",
            Verdict::Fail => "FAIL",
            Verdict::Crash => "CRASH",
            Verdict::Skipped => "SKIPPED",
            Verdict::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The verdict for one test plus whatever the binary recorded about it.
#[derive(Debug, Clone, PartialEq)]
pub struct TestVerdict {
    /// The test this verdict belongs to.
    pub test: TestId,

    /// What happened.
    pub verdict: Verdict,

    /// Captured failure log, if any.
    pub log: Option<String>,

    /// Reported duration, if any.
    pub duration: Option<Duration>,
}

impl TestVerdict {
    /// Creates a verdict without log or duration.
    pub fn new(test: TestId, verdict: Verdict) -> Self {
        Self {
            test,
            verdict,
            log: None,
            duration: None,
        }
    }

    /// Attaches a failure log.
    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        self.log = Some(log.into());
        self
    }

    /// Attaches a duration.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}

/// What a single batch invocation produced.
///
/// Built by [`results::ResultParser`]; `well_formed` is filled in by the
/// crash detector in [`crate::orchestrator::classify`].
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    /// Tests the invocation was expected to run, in filter order.
    pub expected: Vec<TestId>,

    /// Tests that appear in the result file.
    pub executed: BTreeSet<TestId>,

    /// Verdict per expected test that has one.
    pub verdicts: BTreeMap<TestId, TestVerdict>,

    /// Tests present in the result file but never requested.
    pub unexpected: Vec<TestId>,

    /// Last test stdout announced as running.
    pub last_running: Option<TestId>,

    /// Whether a non-empty result file was found.
    pub result_file_present: bool,

    /// Exit code of the invocation.
    pub exit_code: i32,

    /// Whether the pool killed the invocation for exceeding its timeout.
    pub timed_out: bool,

    /// Set by the crash detector.
    pub well_formed: bool,
}

impl BatchOutcome {
    /// Returns true if the process exited with code zero.
    pub fn exit_passed(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Verdicts that count as failures, in expected order.
    pub fn failures(&self) -> Vec<&TestVerdict> {
        self.in_expected_order()
            .filter(|v| v.verdict.is_failure())
            .collect()
    }

    /// Tests that passed, in expected order.
    pub fn passed(&self) -> Vec<TestId> {
        self.in_expected_order()
            .filter(|v| v.verdict == Verdict::Pass)
            .map(|v| v.test.clone())
            .collect()
    }

    /// Expected tests missing from the result file, in expected order.
    pub fn missing(&self) -> Vec<TestId> {
        self.expected
            .iter()
            .filter(|t| !self.executed.contains(*t))
            .cloned()
            .collect()
    }

    fn in_expected_order(&self) -> impl Iterator<Item = &TestVerdict> {
        self.expected.iter().filter_map(|t| self.verdicts.get(t))
    }
}
