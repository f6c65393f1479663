//! Configuration schema definitions for gtest-sieve.
//!
//! All types here deserialize from `sieve.toml`. Every field except the
//! test binary has a default, so a minimal file is two lines.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── SieveConfig        - binary, filter file, workers, run budget
//! ├── SchedulerConfig    - batch sizing and crash-rate tuning
//! ├── VerifyConfig       - deep verification of singleton crashes
//! ├── ProviderConfig     - Tagged enum selecting provider type
//! │   ├── Local          - Local child processes
//! │   └── Default        - Custom shell-command workers
//! └── ReportConfig       - JUnit output settings
//! ```

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration structure.
///
/// # TOML Structure
///
/// ```toml
/// [sieve]
/// binary = "./out/unit_tests"
/// filter_file = "testing/filters/unit_tests.filter.json"
/// workers = 16
///
/// [scheduler]
/// fairness = 4
///
/// [provider]
/// type = "local"
/// ```
///
/// # Example
///
/// ```
/// use gtest_sieve::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [sieve]
///     binary = "./unit_tests"
/// "#).unwrap();
/// assert_eq!(config.sieve.workers, 8);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Core settings.
    pub sieve: SieveConfig,

    /// Batch sizing (optional, has defaults).
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Singleton crash verification (optional, has defaults).
    #[serde(default)]
    pub verify: VerifyConfig,

    /// Where invocations run (optional, defaults to local).
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Report configuration (optional, has defaults).
    #[serde(default)]
    pub report: ReportConfig,
}

/// Core sieve settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `filter_file` | `"<binary name>.filter.json"` next to the config |
/// | `output_dir` | `".sieve"` |
/// | `workers` | 8 |
/// | `batch_timeout_secs` | 600 |
/// | `max_runs` | 5 |
/// | `flake_free_target` | 1 |
/// | `enumerate_attempts` | 3 |
/// | `stream_output` | false |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SieveConfig {
    /// Path to the gtest binary. `~` and `$VARS` are expanded.
    pub binary: String,

    /// Command prefix placed before the binary, e.g. `["xvfb-run", "-a"]`.
    #[serde(default)]
    pub wrapper: Vec<String>,

    /// Extra arguments passed to every invocation of the binary.
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// JSON filter file holding the persisted exclusion set.
    pub filter_file: Option<PathBuf>,

    /// Scratch directory for flag files and per-batch result XML.
    ///
    /// Default: `".sieve"`
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Working directory for the binary.
    pub working_dir: Option<PathBuf>,

    /// Number of concurrent workers.
    ///
    /// Default: 8
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Timeout for a single batch invocation in seconds.
    ///
    /// A batch that exceeds it is killed and treated as a crash.
    ///
    /// Default: 600
    #[serde(default = "default_batch_timeout")]
    pub batch_timeout_secs: u64,

    /// Upper bound on full runs in one session.
    ///
    /// Default: 5
    #[serde(default = "default_max_runs")]
    pub max_runs: usize,

    /// Consecutive clean runs needed to finish successfully.
    ///
    /// Default: 1
    #[serde(default = "default_flake_free_target")]
    pub flake_free_target: usize,

    /// Attempts made to enumerate tests before giving up.
    ///
    /// Default: 3
    #[serde(default = "default_enumerate_attempts")]
    pub enumerate_attempts: usize,

    /// Echo binary output as it arrives.
    ///
    /// Default: false
    #[serde(default)]
    pub stream_output: bool,
}

impl SieveConfig {
    /// The filter file path, derived from the binary name when unset.
    pub fn filter_file(&self) -> PathBuf {
        if let Some(path) = &self.filter_file {
            return path.clone();
        }
        let stem = std::path::Path::new(&self.binary)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "tests".to_string());
        PathBuf::from(format!("{}.filter.json", stem))
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".sieve")
}

fn default_workers() -> usize {
    8
}

fn default_batch_timeout() -> u64 {
    600
}

fn default_max_runs() -> usize {
    5
}

fn default_flake_free_target() -> usize {
    1
}

fn default_enumerate_attempts() -> usize {
    3
}

/// Batch sizing parameters for the adaptive scheduler.
///
/// The base batch size is `pending / (workers * fairness)`. While the
/// observed crash rate stays below `crash_rate_threshold` batches are at
/// least `min_batch_size`; above it they shrink toward
/// `loss_budget / crash_rate` tests.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `fairness` | 4 |
/// | `min_batch_size` | 10 |
/// | `crash_rate_threshold` | 0.05 |
/// | `loss_budget` | 0.5 |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    /// Target number of batches per worker.
    #[serde(default = "default_fairness")]
    pub fairness: usize,

    /// Smallest batch handed out while crashes are rare.
    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,

    /// Crash rate above which batches shrink.
    #[serde(default = "default_crash_rate_threshold")]
    pub crash_rate_threshold: f64,

    /// Expected number of crashes tolerated per batch once shrinking.
    #[serde(default = "default_loss_budget")]
    pub loss_budget: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fairness: default_fairness(),
            min_batch_size: default_min_batch_size(),
            crash_rate_threshold: default_crash_rate_threshold(),
            loss_budget: default_loss_budget(),
        }
    }
}

fn default_fairness() -> usize {
    4
}

fn default_min_batch_size() -> usize {
    10
}

fn default_crash_rate_threshold() -> f64 {
    0.05
}

fn default_loss_budget() -> f64 {
    0.5
}

/// Deep verification of tests that crashed alone.
///
/// A singleton crash is re-run with `--gtest_repeat=repeat`. If every
/// iteration passes the test is excluded for the rest of the session but
/// never written to the filter file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VerifyConfig {
    /// Whether singleton crashes are re-checked at all.
    ///
    /// Default: true
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Iterations per verification run.
    ///
    /// Default: 2
    #[serde(default = "default_repeat")]
    pub repeat: u32,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            repeat: default_repeat(),
        }
    }
}

fn default_repeat() -> u32 {
    2
}

/// Provider configuration specifying where invocations run.
///
/// # Provider Types
///
/// | Type | Description |
/// |------|-------------|
/// | `local` | Child processes on this machine |
/// | `default` | Workers driven by custom shell commands |
///
/// # Example
///
/// ```toml
/// [provider]
/// type = "default"
/// create_command = "./workers/create.sh"
/// exec_command = "./workers/exec.sh {sandbox_id} {command}"
/// destroy_command = "./workers/destroy.sh {sandbox_id}"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderConfig {
    /// Run the binary as local processes.
    Local(LocalProviderConfig),

    /// Run the binary using custom shell commands.
    Default(DefaultProviderConfig),
}

impl Default for ProviderConfig {
    fn default() -> Self {
        ProviderConfig::Local(LocalProviderConfig::default())
    }
}

/// Configuration for the local process provider.
///
/// # Example
///
/// ```toml
/// [provider]
/// type = "local"
/// shell = "/bin/bash"
///
/// [provider.env]
/// ASAN_OPTIONS = "detect_leaks=0"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocalProviderConfig {
    /// Working directory for spawned processes.
    ///
    /// If not specified, uses the current working directory.
    pub working_dir: Option<PathBuf>,

    /// Environment variables set for every invocation.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Shell used to run commands, as `{shell} -c "{command}"`.
    ///
    /// Default: `/bin/sh`
    #[serde(default = "default_shell")]
    pub shell: String,
}

impl Default for LocalProviderConfig {
    fn default() -> Self {
        Self {
            working_dir: None,
            env: HashMap::new(),
            shell: default_shell(),
        }
    }
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

/// Configuration for the shell-command provider.
///
/// See [`crate::provider::default`] for the placeholder protocol.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DefaultProviderConfig {
    /// Creates a worker and prints its ID as the last stdout line.
    pub create_command: String,

    /// Runs one invocation. Placeholders: `{sandbox_id}`, `{command}`.
    pub exec_command: String,

    /// Releases a worker. Placeholder: `{sandbox_id}`.
    pub destroy_command: String,

    /// Copies a flag file to the worker.
    /// Placeholders: `{sandbox_id}`, `{local}`, `{remote}`.
    pub upload_command: Option<String>,

    /// Copies result files back. Placeholders: `{sandbox_id}`, `{paths}`.
    pub download_command: Option<String>,

    /// Local working directory for running the lifecycle commands.
    pub working_dir: Option<PathBuf>,

    /// Timeout for lifecycle commands in seconds.
    ///
    /// Default: 3600 (1 hour)
    #[serde(default = "default_remote_timeout")]
    pub timeout_secs: u64,
}

fn default_remote_timeout() -> u64 {
    3600
}

/// Configuration for test result reporting.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `output_dir` | `"test-results"` |
/// | `junit` | `true` |
/// | `junit_file` | `"junit.xml"` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Directory where report files are written.
    #[serde(default = "default_report_dir")]
    pub output_dir: PathBuf,

    /// Whether to write a JUnit XML report of the last run.
    #[serde(default = "default_true")]
    pub junit: bool,

    /// Filename for the JUnit XML report, inside `output_dir`.
    #[serde(default = "default_junit_file")]
    pub junit_file: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_report_dir(),
            junit: true,
            junit_file: default_junit_file(),
        }
    }
}

impl ReportConfig {
    /// Full path of the JUnit report.
    pub fn junit_path(&self) -> PathBuf {
        self.output_dir.join(&self.junit_file)
    }
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("test-results")
}

fn default_true() -> bool {
    true
}

fn default_junit_file() -> String {
    "junit.xml".to_string()
}

/// Runtime configuration passed to sandbox creation.
///
/// Built by the worker pool, not read from TOML.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Unique identifier for this sandbox instance.
    pub id: String,

    /// Working directory inside the sandbox.
    pub working_dir: Option<String>,

    /// Environment variables to set in the sandbox.
    pub env: Vec<(String, String)>,
}
