//! Configuration schema definitions for testpulse.
//!
//! This module defines the configuration type deserialized from TOML. All
//! durations are stored as integer milliseconds (`*_ms`) so the file format
//! stays unambiguous, and exposed as [`Duration`]s through accessor methods.
//!
//! # Defaults
//!
//! | Field | Default | Range |
//! |-------|---------|-------|
//! | `batch_size` | 100 | 1-1000 |
//! | `flush_interval_ms` | 5000 | > 0 |
//! | `sampling_rate` | 1.0 | 0.0-1.0 |
//! | `max_retries` | 3 | 0-10 |
//! | `retry_delay_ms` | 1000 | |
//! | `retry_backoff` | `exponential` | `fixed`, `exponential` |
//! | `upload_timeout_ms` | 30000 | > 0 |
//! | `enable_compression` | true | |
//! | `enable_offline_queue` | true | |
//! | `offline_queue_dir` | `~/.testpulse/queue` | |
//! | `offline_retention_hours` | 168 (7 days) | |

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{TelemetryError, TelemetryResult};

/// Largest accepted `batch_size`.
pub const MAX_BATCH_SIZE: usize = 1000;

/// Largest accepted `max_retries`.
pub const MAX_RETRIES: u32 = 10;

/// Root configuration consumed by the telemetry pipeline.
///
/// # TOML Structure
///
/// ```toml
/// api_key = "tp_live_123"
/// project_id = "checkout-service"
/// api_endpoint = "https://ingest.example.com/v1/executions"
/// batch_size = 100
/// sampling_rate = 0.5
///
/// [custom_properties]
/// team = "payments"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    /// API key sent as a bearer token with every upload.
    pub api_key: String,

    /// Project the uploaded executions belong to.
    pub project_id: String,

    /// Collection endpoint that receives upload batches.
    pub api_endpoint: String,

    /// Maximum records per upload batch.
    ///
    /// Reaching this many buffered records also triggers an out-of-cycle
    /// flush.
    ///
    /// Default: 100
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Interval between scheduled flushes in milliseconds.
    ///
    /// Default: 5000
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,

    /// Configured environment name.
    ///
    /// Only used when no override or CI environment is detected; see
    /// [`crate::environment`] for the full precedence.
    #[serde(default)]
    pub environment: String,

    /// Fraction of executions admitted to the buffer.
    ///
    /// Default: 1.0
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: f64,

    /// Retries after the first upload attempt for transient failures.
    ///
    /// Default: 3
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry in milliseconds.
    ///
    /// Default: 1000
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// How the retry delay grows between attempts.
    ///
    /// Default: `exponential`
    #[serde(default)]
    pub retry_backoff: BackoffKind,

    /// Growth factor for exponential backoff.
    ///
    /// Default: 2.0
    #[serde(default = "default_backoff_multiplier")]
    pub retry_backoff_multiplier: f64,

    /// Upper bound for a single retry delay in milliseconds.
    ///
    /// Default: 30000
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_ms: u64,

    /// Timeout for a single upload attempt in milliseconds.
    ///
    /// Default: 30000
    #[serde(default = "default_upload_timeout")]
    pub upload_timeout_ms: u64,

    /// Gzip the payload before sending it.
    ///
    /// Default: true
    #[serde(default = "default_true")]
    pub enable_compression: bool,

    /// Persist batches that could not be uploaded.
    ///
    /// Default: true
    #[serde(default = "default_true")]
    pub enable_offline_queue: bool,

    /// Directory of the offline queue. A leading `~` is expanded.
    ///
    /// Default: `"~/.testpulse/queue"`
    #[serde(default = "default_queue_dir")]
    pub offline_queue_dir: String,

    /// Upper bound on queued records; the oldest segments are dropped
    /// beyond it.
    ///
    /// Default: 10000
    #[serde(default = "default_queue_max_records")]
    pub offline_queue_max_records: usize,

    /// Age after which queued records are discarded by cleanup.
    ///
    /// Default: 168 (7 days)
    #[serde(default = "default_retention_hours")]
    pub offline_retention_hours: u64,

    /// Interval between offline queue replay passes in milliseconds.
    ///
    /// Default: 60000
    #[serde(default = "default_queue_retry_interval")]
    pub queue_retry_interval_ms: u64,

    /// Upper bound for the final flush on shutdown in milliseconds.
    ///
    /// Default: 10000
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,

    /// Attach network reachability and latency to upload batches.
    ///
    /// Default: true
    #[serde(default = "default_true")]
    pub enable_network_metrics: bool,

    /// Free-form properties attached to the environment snapshot.
    #[serde(default)]
    pub custom_properties: BTreeMap<String, String>,
}

/// Retry delay growth between upload attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// The same delay before every retry.
    Fixed,
    /// The delay is multiplied by `retry_backoff_multiplier` each retry.
    #[default]
    Exponential,
}

fn default_batch_size() -> usize {
    100
}

fn default_flush_interval() -> u64 {
    5_000
}

fn default_sampling_rate() -> f64 {
    1.0
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    1_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_retry_delay() -> u64 {
    30_000
}

fn default_upload_timeout() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_queue_dir() -> String {
    "~/.testpulse/queue".to_string()
}

fn default_queue_max_records() -> usize {
    10_000
}

fn default_retention_hours() -> u64 {
    168 // 7 days
}

fn default_queue_retry_interval() -> u64 {
    60_000
}

fn default_shutdown_timeout() -> u64 {
    10_000
}

impl TelemetryConfig {
    /// Creates a configuration with the required fields and all defaults.
    pub fn new(
        api_key: impl Into<String>,
        project_id: impl Into<String>,
        api_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            project_id: project_id.into(),
            api_endpoint: api_endpoint.into(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval(),
            environment: String::new(),
            sampling_rate: default_sampling_rate(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay(),
            retry_backoff: BackoffKind::default(),
            retry_backoff_multiplier: default_backoff_multiplier(),
            max_retry_delay_ms: default_max_retry_delay(),
            upload_timeout_ms: default_upload_timeout(),
            enable_compression: true,
            enable_offline_queue: true,
            offline_queue_dir: default_queue_dir(),
            offline_queue_max_records: default_queue_max_records(),
            offline_retention_hours: default_retention_hours(),
            queue_retry_interval_ms: default_queue_retry_interval(),
            shutdown_timeout_ms: default_shutdown_timeout(),
            enable_network_metrics: true,
            custom_properties: BTreeMap::new(),
        }
    }

    /// Checks required fields and value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidArgument`] naming the first invalid
    /// field.
    pub fn validate(&self) -> TelemetryResult<()> {
        if self.api_key.trim().is_empty() {
            return Err(TelemetryError::invalid("api_key must not be empty"));
        }
        if self.project_id.trim().is_empty() {
            return Err(TelemetryError::invalid("project_id must not be empty"));
        }
        match reqwest::Url::parse(&self.api_endpoint) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => {
                return Err(TelemetryError::invalid(format!(
                    "api_endpoint must be http or https, got '{}'",
                    url.scheme()
                )));
            }
            Err(e) => {
                return Err(TelemetryError::invalid(format!(
                    "api_endpoint is not a valid URL: {}",
                    e
                )));
            }
        }
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(TelemetryError::invalid(format!(
                "batch_size must be between 1 and {}, got {}",
                MAX_BATCH_SIZE, self.batch_size
            )));
        }
        if !(0.0..=1.0).contains(&self.sampling_rate) {
            return Err(TelemetryError::invalid(format!(
                "sampling_rate must be between 0.0 and 1.0, got {}",
                self.sampling_rate
            )));
        }
        if self.max_retries > MAX_RETRIES {
            return Err(TelemetryError::invalid(format!(
                "max_retries must be between 0 and {}, got {}",
                MAX_RETRIES, self.max_retries
            )));
        }
        if self.flush_interval_ms == 0 {
            return Err(TelemetryError::invalid("flush_interval_ms must be positive"));
        }
        if self.upload_timeout_ms == 0 {
            return Err(TelemetryError::invalid("upload_timeout_ms must be positive"));
        }
        if self.retry_backoff_multiplier.is_nan() || self.retry_backoff_multiplier < 1.0 {
            return Err(TelemetryError::invalid(format!(
                "retry_backoff_multiplier must be at least 1.0, got {}",
                self.retry_backoff_multiplier
            )));
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_millis(self.upload_timeout_ms)
    }

    pub fn queue_retry_interval(&self) -> Duration {
        Duration::from_millis(self.queue_retry_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.offline_retention_hours.saturating_mul(3600))
    }

    /// Returns the offline queue directory with `~` expanded.
    pub fn offline_queue_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.offline_queue_dir).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> TelemetryConfig {
        TelemetryConfig::new("key", "proj", "https://ingest.example.com/v1")
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let config: TelemetryConfig = toml::from_str(
            r#"
            api_key = "key"
            project_id = "proj"
            api_endpoint = "https://ingest.example.com"
            "#,
        )
        .unwrap();

        assert_eq!(config.batch_size, 100);
        assert_eq!(config.flush_interval(), Duration::from_secs(5));
        assert_eq!(config.sampling_rate, 1.0);
        assert_eq!(config.max_retries, 3);
        assert!(config.enable_compression);
        assert!(config.enable_offline_queue);
        assert!(config.custom_properties.is_empty());
    }

    #[test]
    fn test_backoff_kind_parses_lowercase() {
        let config: TelemetryConfig = toml::from_str(
            r#"
            api_key = "key"
            project_id = "proj"
            api_endpoint = "https://ingest.example.com"
            retry_backoff = "fixed"
            "#,
        )
        .unwrap();
        assert_eq!(config.retry_backoff, BackoffKind::Fixed);
    }

    #[test]
    fn test_validate_batch_size_bounds() {
        let mut config = valid();
        config.batch_size = 0;
        assert!(config.validate().is_err());
        config.batch_size = 1001;
        assert!(config.validate().is_err());
        config.batch_size = 1000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_sampling_rate_bounds() {
        let mut config = valid();
        config.sampling_rate = -0.1;
        assert!(config.validate().is_err());
        config.sampling_rate = 1.5;
        assert!(config.validate().is_err());
        config.sampling_rate = f64::NAN;
        assert!(config.validate().is_err());
        config.sampling_rate = 0.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_max_retries_bounds() {
        let mut config = valid();
        config.max_retries = 11;
        assert!(config.validate().is_err());
        config.max_retries = 10;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_required_fields() {
        let mut config = valid();
        config.api_key = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = valid();
        config.project_id = String::new();
        assert!(config.validate().is_err());

        let mut config = valid();
        config.api_endpoint = "not a url".to_string();
        assert!(config.validate().is_err());

        let mut config = valid();
        config.api_endpoint = "ftp://ingest.example.com".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_offline_queue_path_expands_tilde() {
        let mut config = valid();
        config.offline_queue_dir = "/var/tmp/queue".to_string();
        assert_eq!(config.offline_queue_path(), PathBuf::from("/var/tmp/queue"));
    }

    #[test]
    fn test_retention_in_hours() {
        let mut config = valid();
        config.offline_retention_hours = 2;
        assert_eq!(config.retention(), Duration::from_secs(7200));
    }
}
