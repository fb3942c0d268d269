//! testpulse: client-side test telemetry.
//!
//! This crate captures the outcome of every test run inside a test SDK,
//! buffers it in memory, uploads it in batches to a collection service, and
//! falls back to a durable local queue when uploads fail.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Identity**: Stable fingerprints for tests, parameter sets and failures
//! - **Collector**: Thread-safe buffer with sampling and back-pressure
//! - **Queue**: Crash-tolerant offline store for undelivered executions
//! - **Upload**: Wire payload, compression, retries, upload events
//! - **Scheduler**: Flush and queue-replay loops tying the above together
//! - **Environment / Network**: Best-effort probes enriching each batch
//!
//! ```text
//!  test threads ──record_test──► Collector ──drain──► Uploader ──► service
//!                                    │                   │
//!                               BufferFull            failure
//!                                    ▼                   ▼
//!                             FlushScheduler ◄──replay── OfflineQueue
//! ```
//!
//! # Example
//!
//! ```no_run
//! use testpulse::config::load_config;
//! use testpulse::pipeline::TelemetryPipeline;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("testpulse.toml"))?;
//!     let pipeline = TelemetryPipeline::start(config)?;
//!     // ... record executions as tests finish ...
//!     pipeline.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod collector;
pub mod config;
pub mod environment;
pub mod error;
pub mod execution;
pub mod identity;
pub mod network;
pub mod pipeline;
pub mod queue;
pub mod scheduler;
pub mod upload;

// Re-export commonly used types
pub use collector::{Admission, Collector, CollectorStats};
pub use config::{TelemetryConfig, load_config};
pub use error::{ErrorKind, TelemetryError, TelemetryResult};
pub use execution::{TestExecution, TestOutcome};
pub use identity::{IdentityRequest, ParamValue, TestIdentity};
pub use pipeline::TelemetryPipeline;
pub use queue::OfflineQueue;
pub use upload::{UploadObserver, UploadResult};
