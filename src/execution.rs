//! The record of one completed test run.
//!
//! A [`TestExecution`] is created once when a test finishes and is never
//! modified afterwards. Raw failure text is hashed on the way in (see
//! [`TestExecutionBuilder::with_error_message`]); only the digests are
//! stored, uploaded, or queued.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use testpulse::execution::{TestExecution, TestOutcome};
//! use testpulse::identity::{self, IdentityRequest};
//!
//! let identity = identity::generate(&IdentityRequest::new("cart::adds_item", "cart"))?;
//! let execution = TestExecution::builder(identity, TestOutcome::Failed)
//!     .with_duration(Duration::from_millis(42))
//!     .with_error_message("expected 2 items, found 1")
//!     .build();
//!
//! assert!(execution.error_message_hash.is_some());
//! # Ok::<(), testpulse::TelemetryError>(())
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::environment::EnvironmentInfo;
use crate::error::{TelemetryError, TelemetryResult};
use crate::identity::{self, TestIdentity};
use crate::network::NetworkMetrics;

/// The outcome status of a test execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestOutcome {
    /// Test assertions succeeded.
    Passed,

    /// Test ran and an assertion or expectation failed.
    Failed,

    /// Test was not run.
    Skipped,
}

/// One completed test run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestExecution {
    /// Unique per execution; lets the collection service drop duplicate
    /// deliveries.
    pub execution_id: Uuid,

    /// Shared by every execution recorded by one pipeline instance.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,

    pub identity: TestIdentity,

    pub outcome: TestOutcome,

    pub duration_ms: u64,

    pub started_at: DateTime<Utc>,

    pub finished_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message_hash: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_trace_hash: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<EnvironmentInfo>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkMetrics>,

    /// Categories or traits attached to the test by its framework.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
}

impl TestExecution {
    /// Starts building an execution for the given test and outcome.
    pub fn builder(identity: TestIdentity, outcome: TestOutcome) -> TestExecutionBuilder {
        TestExecutionBuilder::new(identity, outcome)
    }

    /// Returns the parameter hash that distinguishes parameterized variants.
    pub fn parameter_hash(&self) -> Option<&str> {
        self.identity.parameter_hash.as_deref()
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// Checks that the record can be admitted to the pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidArgument`] for a record with a blank
    /// identity or a finish time before its start time.
    pub fn validate(&self) -> TelemetryResult<()> {
        if self.identity.test_id.trim().is_empty() || self.identity.fingerprint.trim().is_empty() {
            return Err(TelemetryError::invalid(
                "execution identity must have a test id and fingerprint",
            ));
        }
        if self.identity.fully_qualified_name.trim().is_empty() {
            return Err(TelemetryError::invalid(
                "execution identity must have a fully qualified name",
            ));
        }
        if self.finished_at < self.started_at {
            return Err(TelemetryError::invalid(format!(
                "execution of '{}' finished before it started",
                self.identity.fully_qualified_name
            )));
        }
        Ok(())
    }
}

/// Builder for [`TestExecution`].
#[derive(Debug, Clone)]
pub struct TestExecutionBuilder {
    identity: TestIdentity,
    outcome: TestOutcome,
    duration: Duration,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    error_message_hash: Option<String>,
    stack_trace_hash: Option<String>,
    environment: Option<EnvironmentInfo>,
    network: Option<NetworkMetrics>,
    categories: Vec<String>,
}

impl TestExecutionBuilder {
    fn new(identity: TestIdentity, outcome: TestOutcome) -> Self {
        Self {
            identity,
            outcome,
            duration: Duration::ZERO,
            started_at: None,
            finished_at: None,
            error_message_hash: None,
            stack_trace_hash: None,
            environment: None,
            network: None,
            categories: Vec::new(),
        }
    }

    /// Sets the duration.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Sets explicit start and finish timestamps.
    ///
    /// Without them the execution is assumed to have just finished.
    pub fn with_timestamps(mut self, started_at: DateTime<Utc>, finished_at: DateTime<Utc>) -> Self {
        self.started_at = Some(started_at);
        self.finished_at = Some(finished_at);
        self
    }

    /// Hashes and stores the failure message. The raw text is not kept.
    pub fn with_error_message(mut self, message: &str) -> Self {
        self.error_message_hash = identity::generate_error_message_hash(Some(message));
        self
    }

    /// Hashes and stores the stack trace. The raw text is not kept.
    pub fn with_stack_trace(mut self, trace: &str) -> Self {
        self.stack_trace_hash = identity::generate_stack_trace_hash(Some(trace));
        self
    }

    /// Sets the environment snapshot.
    pub fn with_environment(mut self, environment: EnvironmentInfo) -> Self {
        self.environment = Some(environment);
        self
    }

    /// Sets the network metrics.
    pub fn with_network(mut self, network: NetworkMetrics) -> Self {
        self.network = Some(network);
        self
    }

    /// Adds a category.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.categories.push(category.into());
        self
    }

    pub fn build(self) -> TestExecution {
        let finished_at = self.finished_at.unwrap_or_else(Utc::now);
        let started_at = self.started_at.unwrap_or_else(|| {
            chrono::Duration::from_std(self.duration)
                .ok()
                .and_then(|d| finished_at.checked_sub_signed(d))
                .unwrap_or(finished_at)
        });
        let duration_ms = if self.duration.is_zero() {
            (finished_at - started_at).num_milliseconds().max(0) as u64
        } else {
            self.duration.as_millis() as u64
        };

        TestExecution {
            execution_id: Uuid::new_v4(),
            run_id: None,
            identity: self.identity,
            outcome: self.outcome,
            duration_ms,
            started_at,
            finished_at,
            error_message_hash: self.error_message_hash,
            stack_trace_hash: self.stack_trace_hash,
            environment: self.environment,
            network: self.network,
            categories: self.categories,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::identity::IdentityRequest;

    /// Builds a passed execution for a named test.
    pub fn sample_execution(name: &str) -> TestExecution {
        let identity = identity::generate(&IdentityRequest::new(name, "sample_tests")).unwrap();
        TestExecution::builder(identity, TestOutcome::Passed)
            .with_duration(Duration::from_millis(5))
            .build()
    }
}
