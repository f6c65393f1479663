//! Session-level tests driving the orchestrator against a scripted pool.
//!
//! `FakePool` plays the part of a gtest binary: it answers
//! `--gtest_list_tests` from a fixed listing (honouring the negative filter
//! in the staged flag file) and runs batches by consulting a script that
//! decides, per test and invocation, whether it passes, fails, crashes the
//! process or silently goes missing from the result file.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

use gtest_sieve::config::{Config, SchedulerConfig, load_config_str};
use gtest_sieve::filter;
use gtest_sieve::framework::gtest::GTestBinary;
use gtest_sieve::framework::{TestId, TestListing, Verdict};
use gtest_sieve::orchestrator::{Orchestrator, RunLoop, SessionOutcome, WorkerPool};
use gtest_sieve::provider::{Command, ExecResult, ProviderResult};
use gtest_sieve::report::NullReporter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Act {
    Pass,
    Fail,
    /// The process dies right after announcing the test.
    Crash,
    /// The test runs but never reaches the result file.
    Vanish,
}

/// What the script sees about the invocation a test runs in.
struct Call {
    /// Zero-based index of the invocation across the whole session.
    index: usize,
    batch_len: usize,
    repeat: Option<u32>,
}

type Script = Box<dyn Fn(&TestId, &Call) -> Act + Send + Sync>;

struct FakePool {
    workers: usize,
    tests: Vec<TestId>,
    script: Script,
    stranger: Option<TestId>,
    /// Cancelled as soon as a batch starts, before it finishes.
    cancel_on_batch: Option<CancellationToken>,
    listings: Mutex<Vec<Vec<String>>>,
    batches: Mutex<Vec<Vec<String>>>,
}

impl FakePool {
    fn new(workers: usize, tests: &[&str], script: Script) -> Self {
        Self {
            workers,
            tests: tests.iter().map(|t| id(t)).collect(),
            script,
            stranger: None,
            cancel_on_batch: None,
            listings: Mutex::new(Vec::new()),
            batches: Mutex::new(Vec::new()),
        }
    }

    fn always(workers: usize, tests: &[&str], act: fn(&TestId) -> Act) -> Self {
        Self::new(workers, tests, Box::new(move |test, _| act(test)))
    }

    fn with_stranger(mut self, test: &str) -> Self {
        self.stranger = Some(id(test));
        self
    }

    fn cancelling(mut self, token: CancellationToken) -> Self {
        self.cancel_on_batch = Some(token);
        self
    }

    /// Exclusion lists passed to each enumeration, in order.
    fn listings(&self) -> Vec<Vec<String>> {
        self.listings.lock().unwrap().clone()
    }

    /// Filters of each batch or verification invocation, in order.
    fn batches(&self) -> Vec<Vec<String>> {
        self.batches.lock().unwrap().clone()
    }

    fn list(&self, cmd: &Command) -> ExecResult {
        let exclusions: Vec<String> = cmd
            .staged_files
            .first()
            .and_then(|f| f.contents.strip_prefix("--gtest_filter=-"))
            .map(|s| s.split(':').map(String::from).collect())
            .unwrap_or_default();
        self.listings.lock().unwrap().push(exclusions.clone());

        let mut stdout = String::from("Running main() from gtest_main.cc\n");
        let mut suite = "";
        for test in &self.tests {
            if exclusions.iter().any(|e| excludes(e, test)) {
                continue;
            }
            if test.suite() != suite {
                suite = test.suite();
                stdout.push_str(&format!("{}\n", suite));
            }
            stdout.push_str(&format!("  {}\n", test.name()));
        }

        ExecResult {
            exit_code: 0,
            stdout,
            ..Default::default()
        }
    }

    fn execute(&self, cmd: &Command) -> ExecResult {
        let filter = cmd
            .staged_files
            .first()
            .and_then(|f| f.contents.strip_prefix("--gtest_filter="))
            .unwrap_or_default()
            .to_string();
        let tests: Vec<TestId> = filter.split(':').filter_map(TestId::parse).collect();
        let repeat = cmd
            .args
            .iter()
            .find_map(|a| a.strip_prefix("--gtest_repeat="))
            .and_then(|n| n.parse().ok());

        let index = {
            let mut batches = self.batches.lock().unwrap();
            batches.push(tests.iter().map(ToString::to_string).collect());
            batches.len() - 1
        };
        let call = Call {
            index,
            batch_len: tests.len(),
            repeat,
        };

        let mut stdout = String::new();
        let mut cases = Vec::new();
        let mut exit_code = 0;
        for test in &tests {
            stdout.push_str(&format!("[ RUN      ] {}\n", test));
            match (self.script)(test, &call) {
                Act::Pass => {
                    stdout.push_str(&format!("[       OK ] {} (0 ms)\n", test));
                    cases.push((test.clone(), false));
                }
                Act::Fail => {
                    stdout.push_str(&format!("[  FAILED  ] {} (0 ms)\n", test));
                    cases.push((test.clone(), true));
                    exit_code = 1;
                }
                Act::Vanish => {}
                Act::Crash => {
                    return ExecResult {
                        exit_code: 134,
                        stdout,
                        stderr: "Aborted (core dumped)".to_string(),
                        duration: Duration::from_millis(5),
                        timed_out: false,
                    };
                }
            }
        }
        if let Some(stranger) = &self.stranger {
            cases.push((stranger.clone(), false));
        }

        if let Some(path) = &cmd.result_file {
            write_xml(path, &cases);
        }
        ExecResult {
            exit_code,
            stdout,
            duration: Duration::from_millis(5),
            ..Default::default()
        }
    }
}

#[async_trait]
impl WorkerPool for FakePool {
    fn workers(&self) -> usize {
        self.workers
    }

    async fn run_sync(&self, cmd: &Command) -> ProviderResult<ExecResult> {
        if cmd.args.iter().any(|a| a == "--gtest_list_tests") {
            return Ok(self.list(cmd));
        }
        Ok(self.execute(cmd))
    }

    async fn run_async(&self, cmd: &Command) -> ProviderResult<ExecResult> {
        tokio::task::yield_now().await;
        if let Some(token) = &self.cancel_on_batch {
            token.cancel();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Ok(self.execute(cmd))
    }
}

fn id(s: &str) -> TestId {
    TestId::parse(s).unwrap()
}

fn excludes(entry: &str, test: &TestId) -> bool {
    match entry.strip_suffix('*') {
        Some(prefix) => test.to_string().starts_with(prefix),
        None => entry == test.to_string(),
    }
}

fn write_xml(path: &Path, cases: &[(TestId, bool)]) {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<testsuites name=\"AllTests\">\n");
    for (test, failed) in cases {
        let suite = test.suite().trim_end_matches('.');
        xml.push_str(&format!("  <testsuite name=\"{}\">\n", suite));
        if *failed {
            xml.push_str(&format!(
                "    <testcase name=\"{}\" classname=\"{}\" status=\"run\" result=\"completed\" time=\"0\">\n      <failure message=\"boom\">expected 1, got 2</failure>\n    </testcase>\n",
                test.name(),
                suite
            ));
        } else {
            xml.push_str(&format!(
                "    <testcase name=\"{}\" classname=\"{}\" status=\"run\" result=\"completed\" time=\"0\"/>\n",
                test.name(),
                suite
            ));
        }
        xml.push_str("  </testsuite>\n");
    }
    xml.push_str("</testsuites>\n");

    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, xml).unwrap();
}

fn config(dir: &TempDir, workers: usize, max_runs: usize) -> Config {
    let text = format!(
        r#"
[sieve]
binary = "fake_unittests"
filter_file = "{filter}"
output_dir = "{out}"
workers = {workers}
max_runs = {max_runs}
enumerate_attempts = 1

[report]
junit = false
"#,
        filter = filter_path(dir).display(),
        out = dir.path().join("out").display(),
    );
    load_config_str(&text).unwrap()
}

fn filter_path(dir: &TempDir) -> PathBuf {
    dir.path().join("fake_unittests.filter.json")
}

fn entries(dir: &TempDir) -> Vec<String> {
    filter::load(&filter_path(dir)).unwrap().into_iter().collect()
}

#[tokio::test]
async fn test_failing_test_is_filtered_and_next_run_passes() {
    let dir = TempDir::new().unwrap();
    let pool = FakePool::always(2, &["Suite.Pass", "Suite.Fail"], |t| {
        if t.name() == "Fail" { Act::Fail } else { Act::Pass }
    });

    let orchestrator = Orchestrator::new(config(&dir, 2, 3), pool, NullReporter);
    let session = assert_ok!(orchestrator.run().await);

    assert_eq!(session.outcome, SessionOutcome::Succeeded);
    assert_eq!(session.exit_code(), 0);
    assert_eq!(session.runs.len(), 2);
    assert_eq!(session.filter_updates, 1);
    assert!(session.runs[0].failed.contains(&id("Suite.Fail")));
    assert_eq!(entries(&dir), vec!["Suite.Fail"]);

    let second = &session.runs[1];
    assert_eq!(second.total_tests, 1);
    assert!(second.success());
    assert!(second.verdicts.contains_key(&id("Suite.Pass")));
    assert!(!second.verdicts.contains_key(&id("Suite.Fail")));
}

#[tokio::test]
async fn test_missing_result_fails_run_and_splits() {
    let dir = TempDir::new().unwrap();
    let pool = FakePool::new(
        1,
        &["Suite.TestA", "Suite.TestB"],
        Box::new(|t, call| {
            if call.index == 0 && t.name() == "TestB" {
                Act::Vanish
            } else {
                Act::Pass
            }
        }),
    );

    let orchestrator = Orchestrator::new(config(&dir, 1, 3), pool, NullReporter);
    let session = assert_ok!(orchestrator.run().await);

    let first = &session.runs[0];
    assert_eq!(first.malformed_batches, 1);
    assert!(first.failed.is_empty());
    assert!(first.crashed.is_empty());
    assert!(!first.success());
    assert_eq!(first.verdicts[&id("Suite.TestB")].verdict, Verdict::Pass);

    assert_eq!(session.outcome, SessionOutcome::Succeeded);
    assert!(session.runs[1].success());
    assert_eq!(session.filter_updates, 0);
    assert!(!filter_path(&dir).exists());

    assert_eq!(
        orchestrator.pool().batches(),
        vec![
            vec!["Suite.TestA", "Suite.TestB"],
            vec!["Suite.TestB"],
            vec!["Suite.TestA", "Suite.TestB"],
        ]
    );
}

#[tokio::test]
async fn test_runtime_only_crash_is_excluded_but_not_persisted() {
    let dir = TempDir::new().unwrap();
    let pool = FakePool::new(
        1,
        &["Suite.TestA", "Suite.TestB"],
        Box::new(|t, call| {
            if t.name() == "TestA" && call.repeat.is_none() {
                Act::Crash
            } else {
                Act::Pass
            }
        }),
    );

    let orchestrator = Orchestrator::new(config(&dir, 1, 3), pool, NullReporter);
    let session = assert_ok!(orchestrator.run().await);

    let first = &session.runs[0];
    assert!(!first.success());
    assert!(first.crashed.is_empty());
    assert_eq!(
        first.runtime_excluded,
        BTreeSet::from([id("Suite.TestA")])
    );
    assert_eq!(first.verdicts[&id("Suite.TestA")].verdict, Verdict::Crash);
    assert_eq!(first.verdicts[&id("Suite.TestB")].verdict, Verdict::Pass);

    assert_eq!(session.outcome, SessionOutcome::Succeeded);
    assert!(session.runtime_excluded.contains(&id("Suite.TestA")));
    assert!(!filter_path(&dir).exists());

    let second = &session.runs[1];
    assert_eq!(second.total_tests, 1);
    let listings = orchestrator.pool().listings();
    assert_eq!(listings[1], vec!["Suite.TestA"]);

    let verification = orchestrator
        .pool()
        .batches()
        .into_iter()
        .filter(|b| b == &vec!["Suite.TestA".to_string()])
        .count();
    // One singleton batch plus one verification run.
    assert_eq!(verification, 2);
}

#[tokio::test]
async fn test_persistent_crash_is_written_to_filter() {
    let dir = TempDir::new().unwrap();
    let pool = FakePool::always(1, &["Suite.TestA", "Suite.TestB"], |t| {
        if t.name() == "TestA" { Act::Crash } else { Act::Pass }
    });

    let orchestrator = Orchestrator::new(config(&dir, 1, 3), pool, NullReporter);
    let session = assert_ok!(orchestrator.run().await);

    assert_eq!(
        session.runs[0].crashed,
        BTreeSet::from([id("Suite.TestA")])
    );
    assert!(session.runtime_excluded.is_empty());
    assert_eq!(entries(&dir), vec!["Suite.TestA"]);
    assert_eq!(session.outcome, SessionOutcome::Succeeded);
}

#[tokio::test]
async fn test_suite_collapses_to_wildcard() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        filter_path(&dir),
        r#"{"failing_tests": ["S.A"], "owner": "net-team"}"#,
    )
    .unwrap();

    let pool = FakePool::always(1, &["S.A", "S.B"], |t| {
        if t.name() == "B" { Act::Fail } else { Act::Pass }
    });

    let orchestrator = Orchestrator::new(config(&dir, 1, 3), pool, NullReporter);
    let session = assert_ok!(orchestrator.run().await);

    assert_eq!(entries(&dir), vec!["S.*"]);
    assert_eq!(session.outcome, SessionOutcome::Succeeded);
    assert_eq!(session.runs[1].total_tests, 0);

    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(filter_path(&dir)).unwrap()).unwrap();
    assert_eq!(raw["owner"], "net-team");
}

#[tokio::test]
async fn test_reset_filter_replaces_stale_entries() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        filter_path(&dir),
        r#"{"failing_tests": ["Suite.Pass", "Gone.Test"]}"#,
    )
    .unwrap();

    let pool = FakePool::always(2, &["Suite.Pass", "Suite.Fail"], |t| {
        if t.name() == "Fail" { Act::Fail } else { Act::Pass }
    });

    let orchestrator =
        Orchestrator::new(config(&dir, 2, 3), pool, NullReporter).with_reset_filter(true);
    let session = assert_ok!(orchestrator.run().await);

    assert_eq!(orchestrator.pool().listings()[0], Vec::<String>::new());
    assert_eq!(session.runs[0].total_tests, 2);
    assert_eq!(entries(&dir), vec!["Suite.Fail"]);
    assert_eq!(orchestrator.pool().listings()[2], vec!["Suite.Fail"]);
}

#[tokio::test]
async fn test_budget_exhausted_when_batches_stay_malformed() {
    let dir = TempDir::new().unwrap();
    let pool = FakePool::new(
        1,
        &["Suite.TestA", "Suite.TestB"],
        Box::new(|t, call| {
            if call.batch_len > 1 && t.name() == "TestB" {
                Act::Vanish
            } else {
                Act::Pass
            }
        }),
    );

    let orchestrator = Orchestrator::new(config(&dir, 1, 2), pool, NullReporter);
    let session = assert_ok!(orchestrator.run().await);

    assert_eq!(session.outcome, SessionOutcome::Exhausted);
    assert_eq!(session.exit_code(), 1);
    assert_eq!(session.runs.len(), 2);
    assert!(session.runs.iter().all(|r| r.malformed_batches == 1));
    assert!(!filter_path(&dir).exists());
}

#[tokio::test]
async fn test_cancelled_session_is_interrupted() {
    let dir = TempDir::new().unwrap();
    let pool = FakePool::always(1, &["Suite.TestA"], |_| Act::Pass);
    let token = CancellationToken::new();
    token.cancel();

    let orchestrator = Orchestrator::new(config(&dir, 1, 3), pool, NullReporter)
        .with_cancellation_token(token);
    let session = assert_ok!(orchestrator.run().await);

    assert_eq!(session.outcome, SessionOutcome::Interrupted);
    assert_eq!(session.exit_code(), 130);
    assert!(session.runs.is_empty());
}

#[tokio::test]
async fn test_interrupt_mid_batch_keeps_its_results() {
    let dir = TempDir::new().unwrap();
    let token = CancellationToken::new();
    let pool = FakePool::always(1, &["Suite.Fail"], |_| Act::Fail).cancelling(token.clone());

    let orchestrator = Orchestrator::new(config(&dir, 1, 3), pool, NullReporter)
        .with_cancellation_token(token);
    let session = assert_ok!(orchestrator.run().await);

    assert_eq!(session.outcome, SessionOutcome::Interrupted);
    assert_eq!(session.exit_code(), 130);
    assert_eq!(session.runs.len(), 1);

    let run = &session.runs[0];
    assert!(run.interrupted);
    assert_eq!(run.classified_batches, 1);
    assert_eq!(run.verdicts.len(), 1);
    assert_eq!(run.verdicts[&id("Suite.Fail")].verdict, Verdict::Fail);

    assert_eq!(session.filter_updates, 1);
    assert_eq!(entries(&dir), vec!["Suite.Fail"]);
    assert_eq!(orchestrator.pool().batches().len(), 1);
}

#[tokio::test]
async fn test_unexpected_test_in_result_file_is_fatal() {
    let dir = TempDir::new().unwrap();
    let pool = FakePool::always(1, &["Suite.TestA"], |_| Act::Pass).with_stranger("Other.Test");

    let orchestrator = Orchestrator::new(config(&dir, 1, 3), pool, NullReporter);
    let err = orchestrator.run().await.unwrap_err();

    assert!(format!("{:#}", err).contains("Other.Test"));
}

#[tokio::test]
async fn test_run_loop_requeues_split_parts_first() {
    let dir = TempDir::new().unwrap();
    let tests = ["S1.A", "S1.B", "S1.C", "S2.D", "S2.E"];
    let pool = FakePool::always(1, &tests, |t| {
        if t.to_string() == "S1.B" { Act::Crash } else { Act::Pass }
    });
    let binary = GTestBinary::new("fake_unittests").with_output_dir(dir.path());
    let listing: TestListing = gtest_sieve::framework::gtest::parse_test_list(
        "S1.\n  A\n  B\n  C\nS2.\n  D\n  E\n",
    );

    let run_loop = RunLoop::new(&pool, &binary, &NullReporter);
    let result = assert_ok!(run_loop.run(1, listing).await);

    // S1.A printed OK before the crash, so it keeps its pass.
    assert_eq!(
        pool.batches(),
        vec![
            vec!["S1.A", "S1.B", "S1.C", "S2.D", "S2.E"],
            vec!["S1.B"],
            vec!["S1.C"],
            vec!["S2.D", "S2.E"],
            vec!["S1.B"],
        ]
    );
    assert_eq!(result.crashed, BTreeSet::from([id("S1.B")]));
    assert_eq!(result.count(Verdict::Pass), 4);
    assert_eq!(result.malformed_batches, 2);
    assert!(!result.success());
}

#[tokio::test]
async fn test_protocol_error_cleans_up_in_flight_batches() {
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("out");
    let pool = FakePool::always(2, &["S1.A", "S1.B", "S2.C", "S2.D"], |_| Act::Pass)
        .with_stranger("Other.Test");
    let binary = GTestBinary::new("fake_unittests").with_output_dir(&out);
    let listing = gtest_sieve::framework::gtest::parse_test_list("S1.\n  A\n  B\nS2.\n  C\n  D\n");

    let run_loop = RunLoop::new(&pool, &binary, &NullReporter).with_scheduler_config(
        SchedulerConfig {
            fairness: 1,
            min_batch_size: 1,
            ..Default::default()
        },
    );
    let err = run_loop.run(1, listing).await.unwrap_err();

    assert!(format!("{:#}", err).contains("Other.Test"));
    assert_eq!(pool.batches().len(), 2);
    let leftovers: Vec<_> = std::fs::read_dir(&out)
        .map(|dir| dir.map(|e| e.unwrap().file_name()).collect())
        .unwrap_or_default();
    assert!(leftovers.is_empty(), "{:?}", leftovers);
}
