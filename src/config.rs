//! Configuration loading and schema definitions for testpulse.
//!
//! This module provides types and functions for loading the telemetry
//! configuration from TOML files or strings. The pipeline consumes a
//! finished [`TelemetryConfig`] read-only; where the values come from is the
//! host's business.
//!
//! # Example
//!
//! ```
//! use testpulse::config::load_config_str;
//!
//! let config = load_config_str(r#"
//!     api_key = "tp_live_123"
//!     project_id = "checkout-service"
//!     api_endpoint = "https://ingest.example.com/v1/executions"
//!     batch_size = 50
//! "#)?;
//!
//! assert_eq!(config.batch_size, 50);
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Loads testpulse configuration from a TOML file.
///
/// The configuration is validated before it is returned, so a successful
/// load can be handed straight to [`crate::pipeline::TelemetryPipeline`].
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - A setting is missing or outside its allowed range
///
/// # Example
///
/// ```no_run
/// use testpulse::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("testpulse.toml"))?;
/// println!("Batch size: {}", config.batch_size);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<TelemetryConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: TelemetryConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;

    Ok(config)
}

/// Loads testpulse configuration from a TOML string.
///
/// Useful for testing, embedding configuration, or generating configuration
/// programmatically.
///
/// # Errors
///
/// Returns an error if the string is not valid TOML, doesn't match the
/// schema, or fails validation.
pub fn load_config_str(content: &str) -> Result<TelemetryConfig> {
    let config: TelemetryConfig = toml::from_str(content).context("Failed to parse config")?;

    config.validate().context("Invalid configuration")?;

    Ok(config)
}

/// Default configuration file written by `testpulse init`.
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# testpulse configuration

# Credentials issued by the collection service.
api_key = "replace-me"
project_id = "my-project"
api_endpoint = "https://ingest.testpulse.dev/v1/executions"

# Records per upload batch (1-1000). Reaching this many buffered records
# triggers an immediate flush.
batch_size = 100
flush_interval_ms = 5000

# Fraction of executions to record (0.0-1.0).
sampling_rate = 1.0

# Upload retries for transient failures (0-10).
max_retries = 3
retry_delay_ms = 1000
retry_backoff = "exponential"
upload_timeout_ms = 30000
enable_compression = true

# Durable local queue for batches that could not be uploaded.
enable_offline_queue = true
offline_queue_dir = "~/.testpulse/queue"
offline_retention_hours = 168

[custom_properties]
# team = "payments"
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_config_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("testpulse.toml");
        std::fs::write(
            &path,
            r#"
            api_key = "key"
            project_id = "proj"
            api_endpoint = "http://localhost:8080/ingest"
            "#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.project_id, "proj");
        assert_eq!(config.batch_size, 100);
    }

    #[test]
    fn test_load_config_missing_file() {
        let result = load_config(Path::new("/nonexistent/testpulse.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_str_rejects_out_of_range() {
        let result = load_config_str(
            r#"
            api_key = "key"
            project_id = "proj"
            api_endpoint = "http://localhost"
            batch_size = 0
            "#,
        );
        let err = format!("{:#}", result.unwrap_err());
        assert!(err.contains("batch_size"), "unexpected error: {}", err);
    }

    #[test]
    fn test_default_template_parses() {
        let config = load_config_str(DEFAULT_CONFIG_TEMPLATE).unwrap();
        assert_eq!(config.project_id, "my-project");
        assert_eq!(config.retry_backoff, BackoffKind::Exponential);
    }
}
