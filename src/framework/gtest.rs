//! GoogleTest binary integration.
//!
//! Everything that knows how a gtest binary is driven lives here:
//!
//! - [`parse_test_list`] reads `--gtest_list_tests` output
//! - [`GTestBinary`] builds list, batch and verification commands
//! - [`scan_stdout`] reads the `[ RUN      ]` / `[       OK ]` progress markers
//!
//! # Command Line
//!
//! Filters can be far longer than a command line allows, so every filter is
//! written to a flag file and passed with `--gtest_flagfile`:
//!
//! ```text
//! <wrapper...> <binary> <extra_args...>
//!     --gtest_flagfile=<output_dir>/<uuid>.flags     (--gtest_filter=A.x:A.y:B.z)
//!     --gtest_output=xml:<output_dir>/<uuid>.xml
//!     [--gtest_repeat=N]
//! ```

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use super::{Batch, SuiteGroup, TestId, TestListing};
use crate::config::SieveConfig;
use crate::provider::Command;

static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[\s*(RUN|OK|FAILED|SKIPPED)\s*\]\s+(\S+)").expect("marker regex")
});

/// Parses `--gtest_list_tests` output into a listing.
///
/// Suite lines start at column zero and end with a period; leaf lines are
/// indented. Trailing `# GetParam() = ...` / `# TypeParam = ...` comments
/// are dropped. Disabled tests are skipped, and lines that fit neither
/// shape (banners printed by `main`, warnings) are ignored.
///
/// ```
/// use gtest_sieve::framework::gtest::parse_test_list;
///
/// let listing = parse_test_list("\
/// MathTest.
///   Adds
///   DISABLED_Divides
/// Param/MathTest.
///   Squares/0  # GetParam() = 2
/// ");
/// assert_eq!(listing.len(), 2);
/// assert_eq!(listing.suites()[1].names, vec!["Squares/0"]);
/// ```
pub fn parse_test_list(stdout: &str) -> TestListing {
    let mut suites: Vec<SuiteGroup> = Vec::new();
    let mut current: Option<SuiteGroup> = None;

    for raw in stdout.lines() {
        let line = strip_comment(raw);
        if line.trim().is_empty() {
            continue;
        }

        let indented = line.starts_with(' ') || line.starts_with('\t');
        let text = line.trim();

        if !indented {
            if let Some(group) = current.take()
                && !group.is_empty()
            {
                suites.push(group);
            }
            if text.ends_with('.') && !text.contains(' ') {
                current = Some(SuiteGroup::new(text, Vec::<String>::new()));
            }
            continue;
        }

        let Some(group) = current.as_mut() else {
            continue;
        };
        let id = TestId::new(group.suite.clone(), text);
        if !id.is_disabled() {
            group.names.push(text.to_string());
        }
    }

    if let Some(group) = current
        && !group.is_empty()
    {
        suites.push(group);
    }

    TestListing::new(merge_repeated_suites(suites))
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => line[..idx].trim_end(),
        None => line.trim_end(),
    }
}

// A suite listed twice is folded into its first occurrence.
fn merge_repeated_suites(suites: Vec<SuiteGroup>) -> Vec<SuiteGroup> {
    let mut merged: Vec<SuiteGroup> = Vec::with_capacity(suites.len());
    for group in suites {
        match merged.iter_mut().find(|g| g.suite == group.suite) {
            Some(existing) => existing.names.extend(group.names),
            None => merged.push(group),
        }
    }
    merged
}

/// Joins tests into a gtest filter expression.
pub fn filter_expression<'a>(tests: impl IntoIterator<Item = &'a TestId>) -> String {
    tests
        .into_iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(":")
}

/// What stdout markers revealed about an invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StdoutMarkers {
    /// The last test announced with `[ RUN      ]`.
    pub last_running: Option<TestId>,

    /// Tests that printed `[       OK ]`.
    pub passed: Vec<TestId>,

    /// Tests that printed `[  FAILED  ]`.
    pub failed: Vec<TestId>,

    /// Tests that printed `[  SKIPPED ]`.
    pub skipped: Vec<TestId>,
}

/// Scans gtest stdout for per-test progress markers.
///
/// The summary block at the end of a run repeats failures as
/// `[  FAILED  ] Suite.Name, where GetParam() = ...`; the trailing comma is
/// stripped and lines such as `[  FAILED  ] 2 tests, listed below:` are
/// ignored because they do not name a test.
pub fn scan_stdout(stdout: &str) -> StdoutMarkers {
    let mut markers = StdoutMarkers::default();

    for line in stdout.lines() {
        let Some(caps) = MARKER_RE.captures(line.trim_start()) else {
            continue;
        };
        let Some(id) = TestId::parse(caps[2].trim_end_matches(',')) else {
            continue;
        };

        match &caps[1] {
            "RUN" => markers.last_running = Some(id),
            "OK" => push_unique(&mut markers.passed, id),
            "FAILED" => push_unique(&mut markers.failed, id),
            "SKIPPED" => push_unique(&mut markers.skipped, id),
            _ => {}
        }
    }

    markers
}

fn push_unique(list: &mut Vec<TestId>, id: TestId) {
    if !list.contains(&id) {
        list.push(id);
    }
}

/// One prepared invocation of the binary.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Command to hand to the worker pool.
    pub command: Command,

    /// Where the binary writes its XML results.
    pub result_path: PathBuf,

    /// Flag file carrying the filter.
    pub flag_file: PathBuf,

    /// Tests the invocation should run, in filter order.
    pub expected: Vec<TestId>,
}

impl Invocation {
    /// Removes the per-invocation scratch files. Missing files are ignored.
    pub async fn cleanup(&self) {
        let _ = tokio::fs::remove_file(&self.result_path).await;
        let _ = tokio::fs::remove_file(&self.flag_file).await;
    }
}

/// A gtest binary and the way it should be launched.
///
/// # Example
///
/// ```
/// use gtest_sieve::framework::gtest::GTestBinary;
/// use gtest_sieve::framework::{Batch, TestId};
///
/// let binary = GTestBinary::new("./unit_tests").with_output_dir("/tmp/sieve");
/// let batch = Batch::from_tests(&[TestId::new("A", "x"), TestId::new("A", "y")]);
/// let inv = binary.batch_invocation(&batch);
///
/// assert_eq!(inv.command.staged_files[0].contents, "--gtest_filter=A.x:A.y");
/// assert!(inv.result_path.starts_with("/tmp/sieve"));
/// ```
#[derive(Debug, Clone)]
pub struct GTestBinary {
    binary: String,
    wrapper: Vec<String>,
    extra_args: Vec<String>,
    output_dir: PathBuf,
    working_dir: Option<String>,
    timeout_secs: u64,
}

impl GTestBinary {
    /// Creates a binary description with default settings.
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            wrapper: Vec::new(),
            extra_args: Vec::new(),
            output_dir: absolute(Path::new(".sieve")),
            working_dir: None,
            timeout_secs: 600,
        }
    }

    /// Builds the binary description from configuration.
    ///
    /// `~` and environment variables in the binary path are expanded.
    pub fn from_config(config: &SieveConfig) -> Self {
        let binary = shellexpand::full(&config.binary)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| config.binary.clone());

        let mut gtest = Self::new(binary)
            .with_wrapper(config.wrapper.clone())
            .with_extra_args(config.extra_args.clone())
            .with_output_dir(&config.output_dir)
            .with_timeout(config.batch_timeout_secs);
        if let Some(dir) = &config.working_dir {
            gtest = gtest.with_working_dir(dir.to_string_lossy());
        }
        gtest
    }

    pub fn with_wrapper(mut self, wrapper: Vec<String>) -> Self {
        self.wrapper = wrapper;
        self
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    /// Sets the scratch directory. Relative paths are made absolute so
    /// workers with a different working directory agree on locations.
    pub fn with_output_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.output_dir = absolute(dir.as_ref());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// The binary path as configured.
    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Scratch directory for flag and result files.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Per-invocation timeout in seconds.
    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    fn base_command(&self) -> Command {
        let mut cmd = match self.wrapper.split_first() {
            Some((program, rest)) => Command::new(program).args(rest.iter().cloned()).arg(&self.binary),
            None => Command::new(&self.binary),
        };
        cmd = cmd.args(self.extra_args.iter().cloned());
        if let Some(dir) = &self.working_dir {
            cmd = cmd.working_dir(dir);
        }
        cmd.timeout(self.timeout_secs)
    }

    fn scratch_path(&self, stem: &str, ext: &str) -> PathBuf {
        self.output_dir.join(format!("{}.{}", stem, ext))
    }

    /// Command that lists tests, excluding the given filter entries.
    ///
    /// Entries are passed verbatim, so wildcard patterns such as `Suite.*`
    /// work as negative filters.
    pub fn list_command(&self, exclusions: &[String]) -> Command {
        let cmd = self.base_command().arg("--gtest_list_tests");
        if exclusions.is_empty() {
            return cmd;
        }

        let flag_file = self.scratch_path(&format!("list-{}", uuid::Uuid::new_v4()), "flags");
        let contents = format!("--gtest_filter=-{}", exclusions.join(":"));
        cmd.arg(format!("--gtest_flagfile={}", flag_file.display()))
            .stage(flag_file, contents)
    }

    /// Prepares the invocation that runs exactly `batch`, in order.
    pub fn batch_invocation(&self, batch: &Batch) -> Invocation {
        self.invocation(batch.tests(), &[])
    }

    /// Prepares a verification run of a single test, repeated `repeat` times.
    ///
    /// The timeout scales with the number of iterations.
    pub fn verify_invocation(&self, test: &TestId, repeat: u32) -> Invocation {
        let mut invocation = self.invocation(
            vec![test.clone()],
            &[format!("--gtest_repeat={}", repeat)],
        );
        invocation.command.timeout_secs =
            Some(self.timeout_secs.saturating_mul(u64::from(repeat.max(1))));
        invocation
    }

    fn invocation(&self, expected: Vec<TestId>, extra: &[String]) -> Invocation {
        let stem = uuid::Uuid::new_v4().to_string();
        let flag_file = self.scratch_path(&stem, "flags");
        let result_path = self.scratch_path(&stem, "xml");

        let contents = format!("--gtest_filter={}", filter_expression(&expected));
        let command = self
            .base_command()
            .arg(format!("--gtest_flagfile={}", flag_file.display()))
            .arg(format!("--gtest_output=xml:{}", result_path.display()))
            .args(extra.iter().cloned())
            .stage(flag_file.clone(), contents)
            .result_file(result_path.clone());

        Invocation {
            command,
            result_path,
            flag_file,
            expected,
        }
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> TestId {
        TestId::parse(s).unwrap()
    }

    #[test]
    fn test_parse_test_list_typed_and_param() {
        let out = "\
Running main() from gtest_main.cc
FooTest.
  Bar
  Baz
TypedTest/0.  # TypeParam = int
  Works
Inst/ParamTest.
  Check/0  # GetParam() = 1
  Check/1  # GetParam() = 2
  DISABLED_Slow/0  # GetParam() = 3
";
        let listing = parse_test_list(out);
        let suites = listing.suites();

        assert_eq!(suites.len(), 3);
        assert_eq!(suites[0].suite, "FooTest.");
        assert_eq!(suites[0].names, vec!["Bar", "Baz"]);
        assert_eq!(suites[1].suite, "TypedTest/0.");
        assert_eq!(suites[2].names, vec!["Check/0", "Check/1"]);
        assert_eq!(listing.len(), 5);
    }

    #[test]
    fn test_parse_test_list_drops_disabled_suite_and_empty_groups() {
        let out = "\
DISABLED_Suite.
  One
Empty.
Live.
  Two
";
        let listing = parse_test_list(out);
        assert_eq!(listing.tests(), vec![id("Live.Two")]);
    }

    #[test]
    fn test_parse_test_list_empty() {
        assert!(parse_test_list("").is_empty());
        assert!(parse_test_list("Running main() from gtest_main.cc\n").is_empty());
    }

    #[test]
    fn test_scan_stdout_markers() {
        let out = "\
[==========] Running 3 tests from 1 test suite.
[ RUN      ] S.A
[       OK ] S.A (0 ms)
[ RUN      ] S.B
foo.cc:12: Failure
[  FAILED  ] S.B (1 ms)
[ RUN      ] S.C
[  SKIPPED ] S.C (0 ms)
[ RUN      ] S.D
[  FAILED  ] 1 test, listed below:
[  FAILED  ] S.B, where GetParam() = 3
";
        let markers = scan_stdout(out);
        assert_eq!(markers.last_running, Some(id("S.D")));
        assert_eq!(markers.passed, vec![id("S.A")]);
        assert_eq!(markers.failed, vec![id("S.B")]);
        assert_eq!(markers.skipped, vec![id("S.C")]);
    }

    #[test]
    fn test_batch_invocation_layout() {
        let binary = GTestBinary::new("./unit_tests")
            .with_wrapper(vec!["xvfb-run".into(), "-a".into()])
            .with_extra_args(vec!["--gtest_color=no".into()])
            .with_output_dir("/tmp/sieve-out")
            .with_working_dir("/build")
            .with_timeout(30);

        let batch = Batch::from_tests(&[id("A.x"), id("B.y"), id("A.z")]);
        let inv = binary.batch_invocation(&batch);

        assert_eq!(inv.expected, vec![id("A.x"), id("A.z"), id("B.y")]);
        assert_eq!(inv.command.program, "xvfb-run");
        assert_eq!(&inv.command.args[..3], &["-a", "./unit_tests", "--gtest_color=no"]);
        assert!(inv.command.args.contains(&format!(
            "--gtest_flagfile={}",
            inv.flag_file.display()
        )));
        assert!(inv.command.args.contains(&format!(
            "--gtest_output=xml:{}",
            inv.result_path.display()
        )));
        assert_eq!(inv.command.staged_files[0].path, inv.flag_file);
        assert_eq!(
            inv.command.staged_files[0].contents,
            "--gtest_filter=A.x:A.z:B.y"
        );
        assert_eq!(inv.command.result_file.as_ref(), Some(&inv.result_path));
        assert_eq!(inv.command.working_dir.as_deref(), Some("/build"));
        assert_eq!(inv.command.timeout_secs, Some(30));
    }

    #[test]
    fn test_invocations_use_distinct_paths() {
        let binary = GTestBinary::new("t").with_output_dir("/tmp/sieve-out");
        let batch = Batch::single(id("A.x"));
        let a = binary.batch_invocation(&batch);
        let b = binary.batch_invocation(&batch);
        assert_ne!(a.result_path, b.result_path);
        assert_ne!(a.flag_file, b.flag_file);
    }

    #[test]
    fn test_verify_invocation_repeats() {
        let binary = GTestBinary::new("t").with_timeout(10);
        let inv = binary.verify_invocation(&id("A.x"), 3);
        assert!(inv.command.args.contains(&"--gtest_repeat=3".to_string()));
        assert_eq!(inv.command.timeout_secs, Some(30));
        assert_eq!(inv.expected, vec![id("A.x")]);
    }

    #[test]
    fn test_list_command_exclusions() {
        let binary = GTestBinary::new("t").with_output_dir("/tmp/sieve-out");

        let plain = binary.list_command(&[]);
        assert_eq!(plain.args, vec!["--gtest_list_tests"]);
        assert!(plain.staged_files.is_empty());

        let filtered = binary.list_command(&["A.x".into(), "B.*".into()]);
        assert_eq!(filtered.staged_files.len(), 1);
        assert_eq!(filtered.staged_files[0].contents, "--gtest_filter=-A.x:B.*");
        assert!(filtered.args[1].starts_with("--gtest_flagfile=/tmp/sieve-out/list-"));
    }

    #[test]
    fn test_filter_expression() {
        assert_eq!(filter_expression(&[id("A.x"), id("B.y")]), "A.x:B.y");
        assert_eq!(filter_expression(Vec::<TestId>::new().iter()), "");
    }
}
