//! Configuration loading and schema definitions for gtest-sieve.
//!
//! Configuration lives in a TOML file (`sieve.toml` by default). The schema
//! is in [`schema`]; this module loads it and checks the values that serde
//! alone cannot.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result, bail};

/// Loads configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the schema
///
/// # Example
///
/// ```no_run
/// use gtest_sieve::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("sieve.toml"))?;
/// println!("Workers: {}", config.sieve.workers);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads configuration from a TOML string.
///
/// # Example
///
/// ```
/// use gtest_sieve::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [sieve]
///     binary = "./unit_tests"
///     workers = 4
///
///     [provider]
///     type = "local"
/// "#)?;
///
/// assert_eq!(config.sieve.workers, 4);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

/// Checks value ranges that the schema cannot express.
pub fn validate(config: &Config) -> Result<()> {
    let sieve = &config.sieve;
    if sieve.binary.trim().is_empty() {
        bail!("sieve.binary must not be empty");
    }
    if sieve.workers == 0 {
        bail!("sieve.workers must be at least 1");
    }
    if sieve.max_runs == 0 {
        bail!("sieve.max_runs must be at least 1");
    }
    if sieve.flake_free_target == 0 || sieve.flake_free_target > sieve.max_runs {
        bail!(
            "sieve.flake_free_target must be between 1 and max_runs ({})",
            sieve.max_runs
        );
    }
    if sieve.enumerate_attempts == 0 {
        bail!("sieve.enumerate_attempts must be at least 1");
    }
    if sieve.batch_timeout_secs == 0 {
        bail!("sieve.batch_timeout_secs must be at least 1");
    }

    let scheduler = &config.scheduler;
    if scheduler.fairness == 0 {
        bail!("scheduler.fairness must be at least 1");
    }
    if scheduler.min_batch_size == 0 {
        bail!("scheduler.min_batch_size must be at least 1");
    }
    if !(scheduler.crash_rate_threshold > 0.0 && scheduler.crash_rate_threshold <= 1.0) {
        bail!("scheduler.crash_rate_threshold must be in (0, 1]");
    }
    if !(scheduler.loss_budget > 0.0) {
        bail!("scheduler.loss_budget must be positive");
    }

    if config.verify.repeat == 0 {
        bail!("verify.repeat must be at least 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_defaults() {
        let config = load_config_str(
            r#"
            [sieve]
            binary = "./unit_tests"
            "#,
        )
        .unwrap();

        assert_eq!(config.sieve.workers, 8);
        assert_eq!(config.sieve.max_runs, 5);
        assert_eq!(config.sieve.flake_free_target, 1);
        assert_eq!(config.scheduler.fairness, 4);
        assert_eq!(config.scheduler.crash_rate_threshold, 0.05);
        assert!(config.verify.enabled);
        assert!(matches!(config.provider, ProviderConfig::Local(_)));
        assert_eq!(
            config.sieve.filter_file(),
            std::path::PathBuf::from("unit_tests.filter.json")
        );
        validate(&config).unwrap();
    }

    #[test]
    fn test_default_provider_config() {
        let config = load_config_str(
            r#"
            [sieve]
            binary = "/opt/tests/browser_tests"
            filter_file = "filters/browser_tests.json"

            [provider]
            type = "default"
            create_command = "echo vm-1"
            exec_command = "run {sandbox_id} {command}"
            destroy_command = "drop {sandbox_id}"
            "#,
        )
        .unwrap();

        match &config.provider {
            ProviderConfig::Default(p) => {
                assert_eq!(p.timeout_secs, 3600);
                assert!(p.upload_command.is_none());
            }
            other => panic!("unexpected provider: {:?}", other),
        }
        assert_eq!(
            config.sieve.filter_file(),
            std::path::PathBuf::from("filters/browser_tests.json")
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = load_config_str("[sieve]\nbinary = \"t\"\n").unwrap();
        config.sieve.flake_free_target = 9;
        assert!(validate(&config).is_err());

        let mut config = load_config_str("[sieve]\nbinary = \"t\"\n").unwrap();
        config.scheduler.crash_rate_threshold = 0.0;
        assert!(validate(&config).is_err());

        let mut config = load_config_str("[sieve]\nbinary = \"t\"\n").unwrap();
        config.sieve.workers = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_missing_binary_is_parse_error() {
        assert!(load_config_str("[sieve]\nworkers = 2\n").is_err());
    }
}
