//! Thread-safe in-memory buffer for recorded executions.
//!
//! The [`Collector`] is the only place executions enter the pipeline. It is
//! called from test worker threads, so [`Collector::record_test`] never does
//! I/O: it applies the sampling gate, appends to the buffer and returns.
//!
//! # Back-pressure
//!
//! When the buffer grows to `batch_size` records the collector broadcasts a
//! single [`BufferFull`] event. The signal is edge-triggered: it fires on the
//! transition to "at or above threshold" and re-arms only once a drain takes
//! the buffer back below it.
//!
//! ```text
//!   record ──► sample gate ──► buffer ──(len reaches batch_size)──► BufferFull
//!                  │                │
//!                  ▼                ▼
//!           total_sampled     drain() ──► up to batch_size records, FIFO
//! ```

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use rand::Rng;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::error::TelemetryResult;
use crate::execution::TestExecution;

/// Broadcast when the buffer crosses the batch-size threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferFull;

/// What happened to a recorded execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Added to the buffer.
    Recorded,
    /// Dropped by the sampling gate.
    Sampled,
    /// Ignored because the collector has been disposed.
    Disposed,
}

/// Point-in-time counters of a [`Collector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CollectorStats {
    /// Executions admitted to the buffer since creation.
    pub total_recorded: u64,
    /// Executions dropped by sampling since creation.
    pub total_sampled: u64,
    /// Executions currently buffered.
    pub buffered: usize,
}

struct BufferState {
    records: VecDeque<TestExecution>,
    above_threshold: bool,
}

/// In-memory buffer with admission sampling.
pub struct Collector {
    batch_size: usize,
    sampling_rate: f64,
    state: Mutex<BufferState>,
    /// Mirrors `state.records.len()`; written only under the state lock.
    buffered: AtomicUsize,
    total_recorded: AtomicU64,
    total_sampled: AtomicU64,
    disposed: AtomicBool,
    events: broadcast::Sender<BufferFull>,
}

impl Collector {
    /// Creates a collector.
    ///
    /// # Arguments
    ///
    /// * `batch_size` - Records per drain and back-pressure threshold.
    ///   Values below 1 are clamped to 1.
    /// * `sampling_rate` - Admission probability, clamped to `[0, 1]`.
    pub fn new(batch_size: usize, sampling_rate: f64) -> Self {
        let (events, _) = broadcast::channel(16);
        let sampling_rate = if sampling_rate.is_nan() {
            1.0
        } else {
            sampling_rate.clamp(0.0, 1.0)
        };
        Self {
            batch_size: batch_size.max(1),
            sampling_rate,
            state: Mutex::new(BufferState {
                records: VecDeque::new(),
                above_threshold: false,
            }),
            buffered: AtomicUsize::new(0),
            total_recorded: AtomicU64::new(0),
            total_sampled: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
            events,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Subscribes to [`BufferFull`] events.
    pub fn subscribe(&self) -> broadcast::Receiver<BufferFull> {
        self.events.subscribe()
    }

    /// Admits or drops one execution.
    ///
    /// Safe to call concurrently from any number of threads.
    ///
    /// # Errors
    ///
    /// Returns [`crate::TelemetryError::InvalidArgument`] for a malformed
    /// execution; the buffer is left untouched.
    pub fn record_test(&self, execution: TestExecution) -> TelemetryResult<Admission> {
        execution.validate()?;

        if self.disposed.load(Ordering::Acquire) {
            trace!(
                "Collector disposed, ignoring {}",
                execution.identity.fully_qualified_name
            );
            return Ok(Admission::Disposed);
        }

        if !self.admit() {
            self.total_sampled.fetch_add(1, Ordering::Relaxed);
            return Ok(Admission::Sampled);
        }

        let crossed = {
            let mut state = self.lock_state();
            state.records.push_back(execution);
            self.buffered.store(state.records.len(), Ordering::Relaxed);
            self.total_recorded.fetch_add(1, Ordering::Relaxed);
            let crossed = !state.above_threshold && state.records.len() >= self.batch_size;
            if crossed {
                state.above_threshold = true;
            }
            crossed
        };

        if crossed {
            debug!("Buffer reached batch size {}", self.batch_size);
            // No subscribers is fine; the timer still flushes.
            let _ = self.events.send(BufferFull);
        }

        Ok(Admission::Recorded)
    }

    /// Removes up to `batch_size` of the oldest records, in insertion order.
    pub fn drain(&self) -> Vec<TestExecution> {
        let mut state = self.lock_state();
        let take = state.records.len().min(self.batch_size);
        let batch: Vec<TestExecution> = state.records.drain(..take).collect();
        self.buffered.store(state.records.len(), Ordering::Relaxed);
        state.above_threshold = state.records.len() >= self.batch_size;
        batch
    }

    /// Removes every buffered record, split into `batch_size` chunks.
    pub fn drain_all(&self) -> Vec<Vec<TestExecution>> {
        let mut state = self.lock_state();
        let mut batches = Vec::new();
        while !state.records.is_empty() {
            let take = state.records.len().min(self.batch_size);
            batches.push(state.records.drain(..take).collect());
        }
        self.buffered.store(0, Ordering::Relaxed);
        state.above_threshold = false;
        batches
    }

    /// Returns a snapshot of the collector's counters.
    ///
    /// Reads atomics only, so it never waits on a concurrent `record_test`.
    pub fn stats(&self) -> CollectorStats {
        CollectorStats {
            total_recorded: self.total_recorded.load(Ordering::Relaxed),
            total_sampled: self.total_sampled.load(Ordering::Relaxed),
            buffered: self.buffered.load(Ordering::Relaxed),
        }
    }

    /// Stops admitting records. Buffered records remain drainable.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn admit(&self) -> bool {
        if self.sampling_rate >= 1.0 {
            true
        } else if self.sampling_rate <= 0.0 {
            false
        } else {
            rand::thread_rng().gen_bool(self.sampling_rate)
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BufferState> {
        // A panic while holding the lock cannot leave the deque half-updated.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
