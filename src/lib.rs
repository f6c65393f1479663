//! gtest-sieve: a parallel, crash-resilient GoogleTest orchestrator.
//!
//! Given a gtest binary, the sieve enumerates its tests, runs them in
//! batches across a pool of isolated workers and works out which tests are
//! genuinely broken and which merely shared a process with something that
//! crashed. Confirmed failures are recorded in a JSON filter file that the
//! next session passes back to the binary as a negative filter.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Framework**: test identity, batches, gtest command lines and result XML
//! - **Discovery**: enumerating tests with `--gtest_list_tests`
//! - **Filter**: the persisted exclusion set and its condensation
//! - **Orchestrator**: scheduling, crash detection, splitting and the run loop
//! - **Providers**: where invocations run (local processes, custom commands)
//! - **Report**: console progress and JUnit XML
//!
//! # Example
//!
//! ```no_run
//! use gtest_sieve::config::load_config;
//! use gtest_sieve::orchestrator::{Orchestrator, SandboxWorkerPool};
//! use gtest_sieve::provider::local::LocalProvider;
//! use gtest_sieve::report::ConsoleReporter;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("sieve.toml"))?;
//!     let pool = SandboxWorkerPool::new(LocalProvider::new(Default::default()), 8);
//!     let session = Orchestrator::new(config, pool, ConsoleReporter::new(false))
//!         .run()
//!         .await?;
//!     println!("stable: {}", session.success());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connector;
pub mod discovery;
pub mod filter;
pub mod framework;
pub mod orchestrator;
pub mod provider;
pub mod report;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use framework::{Batch, TestId, Verdict};
pub use orchestrator::{Orchestrator, RunResult, SessionResult, WorkerPool};
pub use provider::{Sandbox, SandboxProvider};
pub use report::Reporter;
