//! The explicitly owned pipeline instance.
//!
//! A host creates one [`TelemetryPipeline`] before its first test, records
//! executions as tests finish, and shuts the pipeline down once at the end:
//!
//! ```no_run
//! use std::time::Duration;
//! use testpulse::config::TelemetryConfig;
//! use testpulse::execution::{TestExecution, TestOutcome};
//! use testpulse::identity::{self, IdentityRequest};
//! use testpulse::pipeline::TelemetryPipeline;
//!
//! # async fn run() -> testpulse::TelemetryResult<()> {
//! let config = TelemetryConfig::new("tp_live_123", "checkout", "https://ingest.example.com/v1/executions");
//! let pipeline = TelemetryPipeline::start(config)?;
//!
//! let identity = identity::generate(&IdentityRequest::new("cart::adds_item", "cart"))?;
//! pipeline.record_test(
//!     TestExecution::builder(identity, TestOutcome::Passed)
//!         .with_duration(Duration::from_millis(12))
//!         .build(),
//! )?;
//!
//! let report = pipeline.shutdown().await;
//! println!("uploaded {}, queued {}", report.uploaded, report.queued);
//! # Ok(())
//! # }
//! ```
//!
//! Recording never blocks on I/O. Upload and storage failures are logged and
//! reported through observers; they never surface as errors from
//! [`TelemetryPipeline::record_test`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::collector::{Admission, Collector, CollectorStats};
use crate::config::TelemetryConfig;
use crate::environment::EnvironmentInfo;
use crate::error::TelemetryResult;
use crate::execution::TestExecution;
use crate::network::NetworkProbe;
use crate::queue::OfflineQueue;
use crate::scheduler::{FlushReport, FlushScheduler, ReplayReport, SchedulerTasks};
use crate::upload::{HttpTransport, LoggingObserver, Transport, UploadObserver, Uploader};

/// Counters of a running pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStats {
    pub collector: CollectorStats,
    /// Sum of all flushes so far.
    pub flushed: FlushReport,
}

/// Configures and starts a [`TelemetryPipeline`].
pub struct PipelineBuilder {
    config: TelemetryConfig,
    transport: Option<Arc<dyn Transport>>,
    observer: Option<Arc<dyn UploadObserver>>,
    environment: Option<EnvironmentInfo>,
}

impl PipelineBuilder {
    /// Replaces the HTTP transport.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Replaces the default [`LoggingObserver`].
    pub fn with_observer(mut self, observer: Arc<dyn UploadObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Uses a fixed environment snapshot instead of detecting one.
    pub fn with_environment(mut self, environment: EnvironmentInfo) -> Self {
        self.environment = Some(environment);
        self
    }

    /// Validates the configuration and spawns the background loops.
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`crate::TelemetryError::InvalidArgument`] for an invalid
    /// configuration. A queue directory that cannot be opened is not an
    /// error; the pipeline runs without offline queuing.
    pub fn start(self) -> TelemetryResult<TelemetryPipeline> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::from_config(&config)?),
        };
        let observer = self.observer.unwrap_or_else(|| Arc::new(LoggingObserver));
        let environment = self
            .environment
            .unwrap_or_else(|| EnvironmentInfo::current(&config).clone());
        let run_id = Uuid::new_v4();

        let mut uploader = Uploader::from_config(&config, transport)
            .with_observer(observer)
            .with_run_id(run_id)
            .with_environment(environment.clone());
        if config.enable_network_metrics {
            uploader = uploader.with_network_probe(Arc::new(NetworkProbe::for_endpoint(&config.api_endpoint)));
        }

        let queue = if config.enable_offline_queue {
            match OfflineQueue::from_config(&config) {
                Ok(queue) => Some(queue),
                Err(e) => {
                    warn!(
                        "Offline queue at {} unavailable, failed uploads will be dropped: {}",
                        config.offline_queue_path().display(),
                        e
                    );
                    None
                }
            }
        } else {
            None
        };

        if let Some(queue) = &queue {
            let queue = queue.clone();
            tokio::spawn(async move {
                if let Err(e) = queue.blocking(|q| q.cleanup()).await {
                    warn!("Offline queue cleanup failed: {}", e);
                }
            });
        }

        let collector = Arc::new(Collector::new(config.batch_size, config.sampling_rate));
        let scheduler = Arc::new(
            FlushScheduler::new(collector.clone(), Arc::new(uploader), queue)
                .with_flush_interval(config.flush_interval())
                .with_queue_retry_interval(config.queue_retry_interval()),
        );

        let cancel = CancellationToken::new();
        let tasks = scheduler.start(cancel.clone());
        info!(
            run = %run_id,
            "Telemetry pipeline started for project '{}' (environment '{}')",
            config.project_id, environment.environment_name
        );

        Ok(TelemetryPipeline {
            config,
            run_id,
            environment,
            collector,
            scheduler,
            cancel,
            tasks: tokio::sync::Mutex::new(Some(tasks)),
            shut_down: AtomicBool::new(false),
        })
    }
}

/// Owns the collector, the scheduler and its background loops.
pub struct TelemetryPipeline {
    config: Arc<TelemetryConfig>,
    run_id: Uuid,
    environment: EnvironmentInfo,
    collector: Arc<Collector>,
    scheduler: Arc<FlushScheduler>,
    cancel: CancellationToken,
    tasks: tokio::sync::Mutex<Option<SchedulerTasks>>,
    shut_down: AtomicBool,
}

impl TelemetryPipeline {
    pub fn builder(config: TelemetryConfig) -> PipelineBuilder {
        PipelineBuilder {
            config,
            transport: None,
            observer: None,
            environment: None,
        }
    }

    /// Starts a pipeline with the HTTP transport and logging observer.
    pub fn start(config: TelemetryConfig) -> TelemetryResult<Self> {
        Self::builder(config).start()
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    /// Identifier shared by every execution recorded by this pipeline.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn environment(&self) -> &EnvironmentInfo {
        &self.environment
    }

    /// Records a finished test. Returns immediately.
    ///
    /// The run id and environment snapshot are attached when missing.
    ///
    /// # Errors
    ///
    /// Returns [`crate::TelemetryError::InvalidArgument`] for a malformed
    /// execution.
    pub fn record_test(&self, mut execution: TestExecution) -> TelemetryResult<Admission> {
        if execution.run_id.is_none() {
            execution.run_id = Some(self.run_id);
        }
        if execution.environment.is_none() {
            execution.environment = Some(self.environment.clone());
        }
        self.collector.record_test(execution)
    }

    /// Uploads everything buffered now, waiting for an in-flight flush.
    pub async fn flush(&self) -> FlushReport {
        self.scheduler.flush_now(&self.cancel).await
    }

    /// Retries everything in the offline queue now.
    pub async fn replay_queue(&self) -> ReplayReport {
        self.scheduler.replay_queue(&self.cancel).await
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            collector: self.collector.stats(),
            flushed: self.scheduler.totals(),
        }
    }

    /// Stops recording, stops the background loops and runs the bounded
    /// final flush. Later calls return an empty report.
    pub async fn shutdown(&self) -> FlushReport {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return FlushReport::default();
        }

        self.collector.dispose();
        self.cancel.cancel();
        if let Some(tasks) = self.tasks.lock().await.take() {
            tasks.join().await;
        }

        let report = self
            .scheduler
            .shutdown_flush(self.config.shutdown_timeout())
            .await;
        let stats = self.collector.stats();
        info!(
            recorded = stats.total_recorded,
            sampled = stats.total_sampled,
            "Telemetry pipeline stopped: {} uploaded, {} queued, {} dropped, {} rejected",
            report.uploaded,
            report.queued,
            report.dropped,
            report.rejected
        );
        report
    }
}

impl Drop for TelemetryPipeline {
    fn drop(&mut self) {
        if !self.shut_down.load(Ordering::Acquire) {
            let buffered = self.collector.stats().buffered;
            if buffered > 0 {
                warn!(
                    "Telemetry pipeline dropped without shutdown, {} executions not flushed",
                    buffered
                );
            } else {
                debug!("Telemetry pipeline dropped without shutdown");
            }
            self.cancel.cancel();
        }
    }
}
