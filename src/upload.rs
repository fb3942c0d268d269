//! Batch upload with retries.
//!
//! The [`Uploader`] turns a slice of executions into a wire payload, sends it
//! through a [`Transport`], retries transient failures according to its
//! [`RetryPolicy`], and reports the outcome to an [`UploadObserver`].
//!
//! The uploader knows nothing about the offline queue. Deciding what happens
//! to a failed batch is the scheduler's job.
//!
//! # Wire format
//!
//! ```json
//! {
//!   "batchId": "6f1c...",
//!   "projectId": "checkout-service",
//!   "sdkVersion": "0.4.0",
//!   "runId": "0b7e...",
//!   "environment": { "machineName": "ci-7", "isCi": true, ... },
//!   "sentAt": "2024-05-01T12:00:00Z",
//!   "executions": [ { "executionId": "...", "outcome": "failed", ... } ]
//! }
//! ```
//!
//! Field names are camelCase, enums are lowercase strings and absent optional
//! fields are omitted. The body is gzip-compressed when compression is
//! enabled.
//!
//! # Retries
//!
//! | Attempt result | Action |
//! |----------------|--------|
//! | Success | Report success |
//! | Transient, budget left | Sleep per policy, try again |
//! | Transient, budget spent | Report failure |
//! | Permanent | Report failure immediately |
//! | Cancelled | Report failure immediately, no error raised |

pub mod observer;
pub mod retry;
pub mod transport;

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::TelemetryConfig;
use crate::environment::EnvironmentInfo;
use crate::error::TelemetryResult;
use crate::execution::TestExecution;
use crate::network::{NetworkMetrics, NetworkProbe};

pub use observer::{LoggingObserver, MultiObserver, NullObserver, UploadObserver};
pub use retry::{Backoff, RetryPolicy};
pub use transport::{
    EncodedBatch, HttpTransport, Transport, TransportError, UploadReceipt, classify_status,
};

/// Version reported in every payload.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The JSON document posted for one batch.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadBatch<'a> {
    pub batch_id: Uuid,
    pub project_id: &'a str,
    pub sdk_version: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<&'a EnvironmentInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<&'a NetworkMetrics>,
    pub sent_at: DateTime<Utc>,
    pub executions: &'a [TestExecution],
}

/// Why an upload did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Transient errors on every allowed attempt.
    Transient,
    /// Rejected by the service.
    Permanent,
    /// Abandoned because cancellation was requested.
    Cancelled,
    /// The batch could not be serialized or compressed.
    Encoding,
}

/// Outcome of one [`Uploader::upload`] call.
#[derive(Debug, Clone)]
pub struct UploadResult {
    pub batch_id: Uuid,
    pub success: bool,
    /// Records the service accepted; `0` on failure.
    pub accepted_count: usize,
    pub error: Option<String>,
    pub receipt_id: Option<String>,
    /// Wall time across all attempts, including backoff.
    pub duration: Duration,
    /// Size of the body as sent, after compression.
    pub payload_bytes: usize,
    pub attempts: u32,
    pub failure: Option<FailureKind>,
    pub completed_at: DateTime<Utc>,
}

impl UploadResult {
    /// A successful result for a batch that needed no request.
    pub(crate) fn empty() -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            success: true,
            accepted_count: 0,
            error: None,
            receipt_id: None,
            duration: Duration::ZERO,
            payload_bytes: 0,
            attempts: 0,
            failure: None,
            completed_at: Utc::now(),
        }
    }
}

/// Sends batches with retries.
pub struct Uploader {
    transport: Arc<dyn Transport>,
    observer: Arc<dyn UploadObserver>,
    policy: RetryPolicy,
    attempt_timeout: Duration,
    compress: bool,
    project_id: String,
    run_id: Option<Uuid>,
    environment: Option<EnvironmentInfo>,
    network_probe: Option<Arc<NetworkProbe>>,
}

impl Uploader {
    /// Creates an uploader with default policy, no compression and no
    /// observer.
    pub fn new(transport: Arc<dyn Transport>, project_id: impl Into<String>) -> Self {
        Self {
            transport,
            observer: Arc::new(NullObserver),
            policy: RetryPolicy::default(),
            attempt_timeout: Duration::from_secs(30),
            compress: false,
            project_id: project_id.into(),
            run_id: None,
            environment: None,
            network_probe: None,
        }
    }

    /// Creates an uploader using the configured retry, timeout and
    /// compression settings.
    pub fn from_config(config: &TelemetryConfig, transport: Arc<dyn Transport>) -> Self {
        Self::new(transport, config.project_id.clone())
            .with_policy(RetryPolicy::from_config(config))
            .with_attempt_timeout(config.upload_timeout())
            .with_compression(config.enable_compression)
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Bounds each individual attempt.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn UploadObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Attaches a batch-level environment snapshot.
    pub fn with_environment(mut self, environment: EnvironmentInfo) -> Self {
        self.environment = Some(environment);
        self
    }

    /// Measures the network before each batch and includes the result.
    pub fn with_network_probe(mut self, probe: Arc<NetworkProbe>) -> Self {
        self.network_probe = Some(probe);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Serializes and optionally compresses a batch.
    pub fn encode(
        &self,
        batch_id: Uuid,
        executions: &[TestExecution],
        network: Option<&NetworkMetrics>,
    ) -> TelemetryResult<EncodedBatch> {
        let payload = UploadBatch {
            batch_id,
            project_id: &self.project_id,
            sdk_version: SDK_VERSION,
            run_id: self.run_id,
            environment: self.environment.as_ref(),
            network,
            sent_at: Utc::now(),
            executions,
        };
        let json = serde_json::to_vec(&payload)?;

        let body = if self.compress {
            let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 4), Compression::default());
            encoder.write_all(&json)?;
            encoder.finish()?
        } else {
            json
        };

        Ok(EncodedBatch {
            body,
            gzip: self.compress,
            record_count: executions.len(),
        })
    }

    /// Uploads one batch, retrying transient failures.
    ///
    /// Never returns an error: every outcome, cancellation included, is
    /// described by the returned [`UploadResult`] and reported to the
    /// observer.
    pub async fn upload(
        &self,
        executions: &[TestExecution],
        cancel: &CancellationToken,
    ) -> UploadResult {
        if executions.is_empty() {
            return UploadResult::empty();
        }

        let started = Instant::now();
        let batch_id = Uuid::new_v4();
        let network = match &self.network_probe {
            Some(probe) => Some(probe.measure().await),
            None => None,
        };

        let encoded = match self.encode(batch_id, executions, network.as_ref()) {
            Ok(encoded) => encoded,
            Err(e) => {
                let result = self.failed(batch_id, started, 0, 0, FailureKind::Encoding, e.to_string());
                self.observer.on_upload_failed(&result).await;
                return result;
            }
        };
        let payload_bytes = encoded.body.len();
        debug!(
            batch = %batch_id,
            "Uploading {} executions ({} bytes)",
            executions.len(),
            payload_bytes
        );

        let mut attempts = 0;
        let outcome = loop {
            attempts += 1;
            match self.attempt(&encoded, cancel).await {
                Ok(receipt) => break Ok(receipt),
                Err(TransportError::Transient(msg)) if attempts < self.policy.max_attempts() => {
                    let delay = self.policy.delay_for(attempts);
                    warn!(
                        batch = %batch_id,
                        "Upload attempt {} failed: {}; retrying in {:?}",
                        attempts,
                        msg,
                        delay
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break Err(TransportError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => break Err(e),
            }
        };

        match outcome {
            Ok(receipt) => {
                let result = UploadResult {
                    batch_id,
                    success: true,
                    accepted_count: receipt.accepted.unwrap_or(executions.len()),
                    error: None,
                    receipt_id: receipt.receipt_id,
                    duration: started.elapsed(),
                    payload_bytes,
                    attempts,
                    failure: None,
                    completed_at: Utc::now(),
                };
                self.observer.on_upload_succeeded(&result).await;
                result
            }
            Err(err) => {
                let (kind, message) = match err {
                    TransportError::Transient(msg) => (FailureKind::Transient, msg),
                    TransportError::Permanent(msg) => (FailureKind::Permanent, msg),
                    TransportError::Cancelled => {
                        (FailureKind::Cancelled, "upload cancelled".to_string())
                    }
                };
                let result = self.failed(batch_id, started, payload_bytes, attempts, kind, message);
                self.observer.on_upload_failed(&result).await;
                result
            }
        }
    }

    async fn attempt(
        &self,
        encoded: &EncodedBatch,
        cancel: &CancellationToken,
    ) -> Result<UploadReceipt, TransportError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            res = tokio::time::timeout(self.attempt_timeout, self.transport.send(encoded)) => {
                res.unwrap_or_else(|_| {
                    Err(TransportError::Transient(format!(
                        "attempt timed out after {:?}",
                        self.attempt_timeout
                    )))
                })
            }
        }
    }

    fn failed(
        &self,
        batch_id: Uuid,
        started: Instant,
        payload_bytes: usize,
        attempts: u32,
        kind: FailureKind,
        message: String,
    ) -> UploadResult {
        UploadResult {
            batch_id,
            success: false,
            accepted_count: 0,
            error: Some(message),
            receipt_id: None,
            duration: started.elapsed(),
            payload_bytes,
            attempts,
            failure: Some(kind),
            completed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A transport that replays scripted responses, then succeeds.
    #[derive(Default)]
    pub struct ScriptedTransport {
        script: Mutex<VecDeque<Result<UploadReceipt, TransportError>>>,
        fallback: Mutex<Option<TransportError>>,
        reject_marker: Option<String>,
        delay: Option<Duration>,
        calls: AtomicUsize,
        sent: Mutex<Vec<EncodedBatch>>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// Answers every call with `err` once the script runs out.
        pub fn failing(err: TransportError) -> Self {
            let transport = Self::default();
            *transport.fallback.lock().unwrap() = Some(err);
            transport
        }

        pub fn with_response(self, response: Result<UploadReceipt, TransportError>) -> Self {
            self.script.lock().unwrap().push_back(response);
            self
        }

        /// Rejects with HTTP 400 every uncompressed body containing `marker`.
        pub fn rejecting(mut self, marker: &str) -> Self {
            self.reject_marker = Some(marker.to_string());
            self
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        /// Makes subsequent calls succeed.
        pub fn recover(&self) {
            *self.fallback.lock().unwrap() = None;
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn sent(&self) -> Vec<EncodedBatch> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, batch: &EncodedBatch) -> Result<UploadReceipt, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.sent.lock().unwrap().push(batch.clone());
            if let Some(marker) = &self.reject_marker
                && String::from_utf8_lossy(&batch.body).contains(marker.as_str())
            {
                return Err(TransportError::Permanent("HTTP 400".to_string()));
            }
            if let Some(response) = self.script.lock().unwrap().pop_front() {
                return response;
            }
            match self.fallback.lock().unwrap().clone() {
                Some(err) => Err(err),
                None => Ok(UploadReceipt::default()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::ScriptedTransport;
    use super::*;
    use crate::execution::test_support::sample_execution;
    use async_trait::async_trait;
    use std::io::Read;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn records(n: usize) -> Vec<TestExecution> {
        (0..n).map(|i| sample_execution(&format!("t{}", i))).collect()
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::fixed(max_retries, Duration::from_millis(1))
    }

    #[derive(Default)]
    struct Tally {
        succeeded: AtomicUsize,
        failed: AtomicUsize,
    }

    #[async_trait]
    impl UploadObserver for Tally {
        async fn on_upload_succeeded(&self, _result: &UploadResult) {
            self.succeeded.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_upload_failed(&self, _result: &UploadResult) {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let transport = Arc::new(ScriptedTransport::new().with_response(Ok(UploadReceipt {
            receipt_id: Some("r-42".to_string()),
            accepted: None,
        })));
        let tally = Arc::new(Tally::default());
        let uploader = Uploader::new(transport.clone(), "proj").with_observer(tally.clone());

        let result = uploader.upload(&records(3), &CancellationToken::new()).await;
        assert!(result.success);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.accepted_count, 3);
        assert_eq!(result.receipt_id.as_deref(), Some("r-42"));
        assert!(result.payload_bytes > 0);
        assert_eq!(tally.succeeded.load(Ordering::SeqCst), 1);
        assert_eq!(tally.failed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust_retries() {
        let transport = Arc::new(ScriptedTransport::failing(TransportError::Transient(
            "HTTP 503".to_string(),
        )));
        let tally = Arc::new(Tally::default());
        let uploader = Uploader::new(transport.clone(), "proj")
            .with_policy(fast_policy(3))
            .with_observer(tally.clone());

        let result = uploader.upload(&records(2), &CancellationToken::new()).await;
        assert!(!result.success);
        assert_eq!(result.attempts, 4);
        assert_eq!(transport.calls(), 4);
        assert_eq!(result.failure, Some(FailureKind::Transient));
        assert_eq!(result.error.as_deref(), Some("HTTP 503"));
        assert_eq!(result.accepted_count, 0);
        assert_eq!(tally.failed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .with_response(Err(TransportError::Transient("reset".to_string())))
                .with_response(Ok(UploadReceipt::default())),
        );
        let uploader = Uploader::new(transport.clone(), "proj").with_policy(fast_policy(3));

        let result = uploader.upload(&records(1), &CancellationToken::new()).await;
        assert!(result.success);
        assert_eq!(result.attempts, 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let transport = Arc::new(ScriptedTransport::failing(TransportError::Permanent(
            "HTTP 401".to_string(),
        )));
        let uploader = Uploader::new(transport.clone(), "proj").with_policy(fast_policy(5));

        let result = uploader.upload(&records(1), &CancellationToken::new()).await;
        assert!(!result.success);
        assert_eq!(result.attempts, 1);
        assert_eq!(transport.calls(), 1);
        assert_eq!(result.failure, Some(FailureKind::Permanent));
    }

    #[tokio::test]
    async fn test_zero_retries_makes_one_attempt() {
        let transport = Arc::new(ScriptedTransport::failing(TransportError::Transient(
            "down".to_string(),
        )));
        let uploader = Uploader::new(transport.clone(), "proj").with_policy(fast_policy(0));

        let result = uploader.upload(&records(1), &CancellationToken::new()).await;
        assert_eq!(result.attempts, 1);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_during_backoff() {
        let transport = Arc::new(ScriptedTransport::failing(TransportError::Transient(
            "down".to_string(),
        )));
        let uploader = Uploader::new(transport.clone(), "proj")
            .with_policy(RetryPolicy::fixed(5, Duration::from_secs(60)));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = uploader.upload(&records(1), &cancel).await;
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::Cancelled));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_already_cancelled_token_sends_nothing() {
        let transport = Arc::new(ScriptedTransport::new());
        let uploader = Uploader::new(transport.clone(), "proj");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = uploader.upload(&records(1), &cancel).await;
        assert_eq!(result.failure, Some(FailureKind::Cancelled));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_slow_attempt_times_out_as_transient() {
        let transport = Arc::new(ScriptedTransport::new().with_delay(Duration::from_secs(30)));
        let uploader = Uploader::new(transport.clone(), "proj")
            .with_policy(fast_policy(1))
            .with_attempt_timeout(Duration::from_millis(20));

        let result = uploader.upload(&records(1), &CancellationToken::new()).await;
        assert_eq!(result.attempts, 2);
        assert_eq!(result.failure, Some(FailureKind::Transient));
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_empty_batch_sends_nothing() {
        let transport = Arc::new(ScriptedTransport::new());
        let uploader = Uploader::new(transport.clone(), "proj");

        let result = uploader.upload(&[], &CancellationToken::new()).await;
        assert!(result.success);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_compressed_payload_shape() {
        let transport = Arc::new(ScriptedTransport::new());
        let run_id = Uuid::new_v4();
        let uploader = Uploader::new(transport.clone(), "checkout")
            .with_compression(true)
            .with_run_id(run_id);

        uploader.upload(&records(2), &CancellationToken::new()).await;

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].gzip);
        assert_eq!(sent[0].record_count, 2);

        let mut json = String::new();
        flate2::read::GzDecoder::new(sent[0].body.as_slice())
            .read_to_string(&mut json)
            .unwrap();
        assert!(!json.contains("null"));

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["projectId"], "checkout");
        assert_eq!(value["sdkVersion"], SDK_VERSION);
        assert_eq!(value["runId"], run_id.to_string());
        assert_eq!(value["executions"].as_array().unwrap().len(), 2);
        assert_eq!(value["executions"][0]["identity"]["fullyQualifiedName"], "t0");
        assert!(value.get("environment").is_none());
        assert!(value.get("network").is_none());
    }

    #[test]
    fn test_uncompressed_encoding_is_plain_json() {
        let uploader = Uploader::new(Arc::new(ScriptedTransport::new()), "proj");
        let batch_id = Uuid::new_v4();
        let encoded = uploader.encode(batch_id, &records(1), None).unwrap();
        assert!(!encoded.gzip);

        let value: serde_json::Value = serde_json::from_slice(&encoded.body).unwrap();
        assert_eq!(value["batchId"], batch_id.to_string());
        assert_eq!(value["executions"][0]["outcome"], "passed");
    }
}
