//! gtest-sieve CLI - parallel, crash-resilient GoogleTest runner.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use gtest_sieve::config::{self, Config, ProviderConfig};
use gtest_sieve::discovery::TestEnumerator;
use gtest_sieve::filter;
use gtest_sieve::framework::gtest::GTestBinary;
use gtest_sieve::orchestrator::{Orchestrator, OutputCallback, SandboxWorkerPool};
use gtest_sieve::provider::default::DefaultProvider;
use gtest_sieve::provider::local::LocalProvider;
use gtest_sieve::provider::{OutputLine, SandboxProvider};
use gtest_sieve::report::{ConsoleReporter, JUnitReporter, MultiReporter, print_summary};

#[derive(Parser)]
#[command(name = "gtest-sieve")]
#[command(about = "Parallel, crash-resilient GoogleTest runner", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "sieve.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the binary until the suite is stable
    Run {
        /// Override the number of workers
        #[arg(short, long)]
        workers: Option<usize>,

        /// Override the maximum number of runs
        #[arg(long)]
        max_runs: Option<usize>,

        /// Override the test binary
        #[arg(long)]
        binary: Option<String>,

        /// Ignore the existing filter file and replace it on first update
        #[arg(long)]
        reset_filter: bool,

        /// JUnit XML output path
        #[arg(long)]
        junit: Option<PathBuf>,
    },

    /// List the tests the binary would run
    List {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,

        /// Include tests excluded by the filter file
        #[arg(long)]
        all: bool,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Provider type (local, default)
        #[arg(short, long, default_value = "local")]
        provider: String,

        /// Path of the gtest binary
        #[arg(short, long, default_value = "./unit_tests")]
        binary: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            workers,
            max_runs,
            binary,
            reset_filter,
            junit,
        } => {
            let overrides = Overrides {
                workers,
                max_runs,
                binary,
            };
            run_session(&cli.config, overrides, reset_filter, junit, cli.verbose).await
        }
        Commands::List { format, all } => list_tests(&cli.config, &format, all).await,
        Commands::Validate => validate_config(&cli.config),
        Commands::Init { provider, binary } => init_config(&provider, &binary),
    }
}

struct Overrides {
    workers: Option<usize>,
    max_runs: Option<usize>,
    binary: Option<String>,
}

fn load(config_path: &Path, overrides: Overrides) -> Result<Config> {
    let mut config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    if let Some(workers) = overrides.workers {
        config.sieve.workers = workers;
    }
    if let Some(max_runs) = overrides.max_runs {
        config.sieve.max_runs = max_runs;
    }
    if let Some(binary) = overrides.binary {
        config.sieve.binary = binary;
    }

    config::validate(&config)?;
    info!("Loaded configuration from {}", config_path.display());
    Ok(config)
}

async fn run_session(
    config_path: &Path,
    overrides: Overrides,
    reset_filter: bool,
    junit_path: Option<PathBuf>,
    verbose: bool,
) -> Result<()> {
    let config = load(config_path, overrides)?;

    match config.provider.clone() {
        ProviderConfig::Local(p_cfg) => {
            run_with(config, LocalProvider::new(p_cfg), reset_filter, junit_path, verbose).await
        }
        ProviderConfig::Default(p_cfg) => {
            let provider = DefaultProvider::from_config(p_cfg);
            run_with(config, provider, reset_filter, junit_path, verbose).await
        }
    }
}

/// Only the default provider's exec scripts wrap results in JSON.
fn uses_json_protocol(config: &Config) -> bool {
    matches!(config.provider, ProviderConfig::Default(_))
}

fn create_pool<P>(config: &Config, provider: P) -> SandboxWorkerPool<P>
where
    P: SandboxProvider,
{
    let mut pool = SandboxWorkerPool::new(provider, config.sieve.workers)
        .with_json_protocol(uses_json_protocol(config));
    if let Some(dir) = &config.sieve.working_dir {
        pool = pool.with_working_dir(dir.to_string_lossy());
    }
    if config.sieve.stream_output {
        let callback: OutputCallback = Arc::new(|sandbox_id, line| match line {
            OutputLine::Stdout(s) => println!("[{}] {}", sandbox_id, s),
            OutputLine::Stderr(s) => eprintln!("[{}] {}", sandbox_id, s),
            OutputLine::ExitCode(_) => {}
        });
        pool = pool.with_output_callback(callback);
    }
    pool
}

async fn run_with<P>(
    config: Config,
    provider: P,
    reset_filter: bool,
    junit_path: Option<PathBuf>,
    verbose: bool,
) -> Result<()>
where
    P: SandboxProvider + 'static,
{
    let pool = create_pool(&config, provider);
    let reporter = create_reporter(&config, junit_path, verbose);

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing in-flight batches");
            signal_token.cancel();
        }
    });

    let orchestrator = Orchestrator::new(config, pool, reporter)
        .with_reset_filter(reset_filter)
        .with_cancellation_token(token);

    let session = orchestrator.run().await;
    orchestrator.pool().shutdown().await;
    let session = session?;

    print_summary(&session);
    info!("Filter file: {}", orchestrator.filter_path().display());

    std::process::exit(session.exit_code());
}

async fn list_tests(config_path: &Path, format: &str, all: bool) -> Result<()> {
    let config = load(
        config_path,
        Overrides {
            workers: None,
            max_runs: None,
            binary: None,
        },
    )?;

    match config.provider.clone() {
        ProviderConfig::Local(p_cfg) => {
            list_with(&config, LocalProvider::new(p_cfg), format, all).await
        }
        ProviderConfig::Default(p_cfg) => {
            list_with(&config, DefaultProvider::from_config(p_cfg), format, all).await
        }
    }
}

async fn list_with<P>(config: &Config, provider: P, format: &str, all: bool) -> Result<()>
where
    P: SandboxProvider,
{
    let exclusions: Vec<String> = if all {
        Vec::new()
    } else {
        filter::load(&config.sieve.filter_file())?
            .into_iter()
            .collect()
    };

    let pool = SandboxWorkerPool::new(provider, 1).with_json_protocol(uses_json_protocol(config));
    let enumerator = TestEnumerator::new(
        GTestBinary::from_config(&config.sieve),
        config.sieve.enumerate_attempts,
    );
    let listing = enumerator.enumerate(&pool, &exclusions).await;
    pool.shutdown().await;
    let listing = listing?;

    match format {
        "json" => {
            let mut suites = serde_json::Map::new();
            for group in listing.suites() {
                suites.insert(
                    group.suite.trim_end_matches('.').to_string(),
                    serde_json::json!(group.names),
                );
            }
            println!("{}", serde_json::to_string_pretty(&suites)?);
        }
        _ => {
            println!(
                "{} tests in {} suites ({} filter entries applied):",
                listing.len(),
                listing.suites().len(),
                exclusions.len()
            );
            for test in listing.tests() {
                println!("  {}", test);
            }
        }
    }

    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    let config = match config::load_config(config_path)
        .and_then(|config| config::validate(&config).map(|_| config))
    {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    };

    println!("Configuration is valid!");
    println!();
    println!("Settings:");
    println!("  Binary: {}", config.sieve.binary);
    println!("  Filter file: {}", config.sieve.filter_file().display());
    println!("  Workers: {}", config.sieve.workers);
    println!("  Batch timeout: {}s", config.sieve.batch_timeout_secs);
    println!(
        "  Runs: up to {} (stop after {} clean)",
        config.sieve.max_runs, config.sieve.flake_free_target
    );

    let provider_name = match &config.provider {
        ProviderConfig::Local(_) => "local",
        ProviderConfig::Default(_) => "default",
    };
    println!("  Provider: {}", provider_name);

    Ok(())
}

fn init_config(provider: &str, binary: &str) -> Result<()> {
    let provider_config = match provider {
        "local" => {
            r#"[provider]
type = "local"
shell = "/bin/sh""#
        }
        "default" => {
            r#"[provider]
type = "default"
# Prints the id of a fresh worker on its last stdout line
create_command = "./workers/create.sh"
# Runs one gtest invocation; may print {"exit_code": N, "stdout": "...", "stderr": "..."} last
exec_command = "./workers/exec.sh {sandbox_id} {command}"
destroy_command = "./workers/destroy.sh {sandbox_id}"
# Needed only when workers do not share this filesystem
# upload_command = "./workers/upload.sh {sandbox_id} {local} {remote}"
# download_command = "./workers/download.sh {sandbox_id} {paths}"
timeout_secs = 3600"#
        }
        _ => {
            eprintln!("Unknown provider: {}. Use: local, default", provider);
            std::process::exit(1);
        }
    };

    let config = format!(
        r#"# gtest-sieve configuration file

[sieve]
binary = "{}"
workers = 8
batch_timeout_secs = 600
max_runs = 5
flake_free_target = 1

[scheduler]
fairness = 4
min_batch_size = 10
crash_rate_threshold = 0.05
loss_budget = 0.5

[verify]
enabled = true
repeat = 2

{}

[report]
output_dir = "test-results"
junit = true
junit_file = "junit.xml"
"#,
        binary, provider_config
    );

    let path = PathBuf::from("sieve.toml");
    if path.exists() {
        eprintln!("sieve.toml already exists. Remove it first or edit manually.");
        std::process::exit(1);
    }

    std::fs::write(&path, config)?;
    println!("Created sieve.toml");
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  gtest-sieve run");

    Ok(())
}

fn create_reporter(config: &Config, junit_override: Option<PathBuf>, verbose: bool) -> MultiReporter {
    let mut multi = MultiReporter::new().with_reporter(ConsoleReporter::new(verbose));

    if config.report.junit || junit_override.is_some() {
        let junit_path = junit_override.unwrap_or_else(|| config.report.junit_path());
        let name = Path::new(&config.sieve.binary)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "gtest-sieve".to_string());
        multi = multi.with_reporter(JUnitReporter::new(junit_path).with_name(name));
    }

    multi
}
