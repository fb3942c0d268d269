//! Flush orchestration.
//!
//! The [`FlushScheduler`] is the only component that touches the collector,
//! the uploader and the offline queue together. It runs two background
//! loops:
//!
//! ```text
//!   flush loop:   (interval tick | BufferFull) ──► drain ──► upload ──► ok
//!                                                              │
//!                                                           failure
//!                                                              ▼
//!                                                        queue.enqueue
//!
//!   replay loop:  interval tick ──► queue.claim ──► upload ──► complete
//!                                                     │
//!                                          rejected ──┼──► complete
//!                                                     │
//!                                          transient ─┴──► release
//! ```
//!
//! A batch the service rejected outright is never queued or replayed: the
//! same payload would be rejected again and would hold up every record
//! queued behind it.
//!
//! At most one flush runs at a time. Timer and back-pressure triggers are
//! skipped while a flush is in flight; [`FlushScheduler::flush_now`] waits
//! for it instead. A drained record is therefore always in exactly one place:
//! the buffer, the in-flight batch, or the queue.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::select;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collector::Collector;
use crate::execution::TestExecution;
use crate::queue::OfflineQueue;
use crate::upload::{FailureKind, Uploader};

/// What one or more flushes did with the drained records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Records taken from the collector.
    pub drained: usize,
    /// Records the service accepted.
    pub uploaded: usize,
    /// Records moved to the offline queue.
    pub queued: usize,
    /// Records lost: upload failed and no queue could take them.
    pub dropped: usize,
    /// Records the service rejected permanently; they are discarded.
    pub rejected: usize,
}

impl FlushReport {
    fn merge(&mut self, other: &FlushReport) {
        self.drained += other.drained;
        self.uploaded += other.uploaded;
        self.queued += other.queued;
        self.dropped += other.dropped;
        self.rejected += other.rejected;
    }
}

/// What a queue replay did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Queued records delivered and removed from the queue.
    pub uploaded: usize,
    /// Records put back after a failed upload.
    pub returned: usize,
    /// Records the service rejected permanently, removed from the queue.
    pub rejected: usize,
}

/// Handles of the background loops.
pub struct SchedulerTasks {
    flush: JoinHandle<()>,
    replay: Option<JoinHandle<()>>,
}

impl SchedulerTasks {
    /// Waits for both loops to exit.
    pub async fn join(self) {
        if let Err(e) = self.flush.await {
            warn!("Flush loop ended abnormally: {}", e);
        }
        if let Some(replay) = self.replay
            && let Err(e) = replay.await
        {
            warn!("Queue replay loop ended abnormally: {}", e);
        }
    }
}

/// Drains, uploads and reconciles failures with the offline queue.
pub struct FlushScheduler {
    collector: Arc<Collector>,
    uploader: Arc<Uploader>,
    queue: Option<OfflineQueue>,
    flush_interval: Duration,
    queue_retry_interval: Duration,
    in_flight: tokio::sync::Mutex<()>,
    replaying: tokio::sync::Mutex<()>,
    totals: Mutex<FlushReport>,
}

impl FlushScheduler {
    /// Creates a scheduler. Without a queue, failed batches are dropped.
    pub fn new(collector: Arc<Collector>, uploader: Arc<Uploader>, queue: Option<OfflineQueue>) -> Self {
        Self {
            collector,
            uploader,
            queue,
            flush_interval: Duration::from_secs(5),
            queue_retry_interval: Duration::from_secs(60),
            in_flight: tokio::sync::Mutex::new(()),
            replaying: tokio::sync::Mutex::new(()),
            totals: Mutex::new(FlushReport::default()),
        }
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_queue_retry_interval(mut self, interval: Duration) -> Self {
        self.queue_retry_interval = interval;
        self
    }

    pub fn queue(&self) -> Option<&OfflineQueue> {
        self.queue.as_ref()
    }

    /// Sum of every flush run so far.
    pub fn totals(&self) -> FlushReport {
        *self.totals.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawns the flush loop and, with a queue, the replay loop.
    ///
    /// Both stop when `cancel` fires. Records still buffered at that point
    /// are left for [`FlushScheduler::shutdown_flush`].
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> SchedulerTasks {
        let flush = tokio::spawn(Arc::clone(self).flush_loop(cancel.clone()));
        let replay = self
            .queue
            .is_some()
            .then(|| tokio::spawn(Arc::clone(self).replay_loop(cancel)));
        SchedulerTasks { flush, replay }
    }

    async fn flush_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut buffer_full = self.collector.subscribe();
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.try_flush(&cancel).await;
                }
                event = buffer_full.recv() => match event {
                    Ok(_) | Err(RecvError::Lagged(_)) => {
                        debug!("Buffer full, flushing early");
                        self.try_flush(&cancel).await;
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!("Flush loop stopped");
    }

    async fn replay_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.queue_retry_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.replay_queue(&cancel).await;
                }
            }
        }
        debug!("Queue replay loop stopped");
    }

    /// Runs a flush unless one is already in flight.
    pub async fn try_flush(&self, cancel: &CancellationToken) -> Option<FlushReport> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!("Flush already in flight, skipping");
            return None;
        };
        Some(self.flush_locked(cancel).await)
    }

    /// Runs a flush, waiting for an in-flight one to finish first.
    pub async fn flush_now(&self, cancel: &CancellationToken) -> FlushReport {
        let _guard = self.in_flight.lock().await;
        self.flush_locked(cancel).await
    }

    /// Drains the whole buffer. Once an upload fails, the rest of the buffer
    /// goes straight to the queue instead of waiting on the same endpoint.
    async fn flush_locked(&self, cancel: &CancellationToken) -> FlushReport {
        let mut report = FlushReport::default();
        let mut endpoint_down = false;

        loop {
            let batch = self.collector.drain();
            if batch.is_empty() {
                break;
            }
            report.drained += batch.len();

            if endpoint_down {
                self.stash(batch, &mut report).await;
                continue;
            }

            let result = self.uploader.upload(&batch, cancel).await;
            if result.success {
                report.uploaded += batch.len();
            } else if is_rejection(result.failure) {
                error!(
                    "Service rejected {} executions, discarding them: {}",
                    batch.len(),
                    result.error.as_deref().unwrap_or("unknown error")
                );
                report.rejected += batch.len();
            } else {
                if result.failure != Some(FailureKind::Cancelled) {
                    warn!(
                        "Upload of {} executions failed: {}",
                        batch.len(),
                        result.error.as_deref().unwrap_or("unknown error")
                    );
                }
                endpoint_down = true;
                self.stash(batch, &mut report).await;
            }
        }

        if report.drained > 0 {
            debug!(
                drained = report.drained,
                uploaded = report.uploaded,
                queued = report.queued,
                dropped = report.dropped,
                rejected = report.rejected,
                "Flush finished"
            );
        }
        self.totals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .merge(&report);
        report
    }

    async fn stash(&self, batch: Vec<TestExecution>, report: &mut FlushReport) {
        let count = batch.len();
        let Some(queue) = &self.queue else {
            warn!("Offline queue disabled, dropping {} executions", count);
            report.dropped += count;
            return;
        };

        match queue.blocking(move |q| q.enqueue(&batch)).await {
            Ok(written) => {
                debug!("Queued {} executions for later upload", written);
                report.queued += written;
            }
            Err(e) => {
                warn!("Failed to queue {} executions: {}", count, e);
                report.dropped += count;
            }
        }
    }

    /// Uploads queued records until the queue is empty or an upload fails
    /// transiently.
    ///
    /// Records are removed from the queue once the service accepted them or
    /// rejected them permanently. A transient failure returns the lease to
    /// the head of the queue and ends the pass.
    pub async fn replay_queue(&self, cancel: &CancellationToken) -> ReplayReport {
        let mut report = ReplayReport::default();
        let Some(queue) = &self.queue else {
            return report;
        };
        let Ok(_guard) = self.replaying.try_lock() else {
            debug!("Queue replay already running, skipping");
            return report;
        };

        let batch_size = self.collector.batch_size();
        while !cancel.is_cancelled() {
            let lease = match queue.blocking(move |q| q.claim(batch_size)).await {
                Ok(Some(lease)) => lease,
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read offline queue: {}", e);
                    break;
                }
            };

            let count = lease.len();
            let result = self.uploader.upload(lease.records(), cancel).await;
            if result.success {
                if let Err(e) = lease.complete() {
                    warn!("Failed to remove {} replayed executions: {}", count, e);
                }
                report.uploaded += count;
            } else if is_rejection(result.failure) {
                error!(
                    "Service rejected {} queued executions, removing them: {}",
                    count,
                    result.error.as_deref().unwrap_or("unknown error")
                );
                if let Err(e) = lease.complete() {
                    warn!("Failed to remove {} rejected executions: {}", count, e);
                }
                report.rejected += count;
            } else {
                if let Err(e) = lease.release() {
                    warn!("Failed to return {} executions to the queue: {}", count, e);
                }
                report.returned += count;
                break;
            }
        }

        if report.uploaded > 0 || report.returned > 0 || report.rejected > 0 {
            info!(
                "Replayed {} queued executions ({} returned to the queue, {} rejected)",
                report.uploaded, report.returned, report.rejected
            );
        }
        report
    }

    /// Final flush on shutdown, bounded by `timeout`.
    ///
    /// When the deadline passes the in-flight upload is cancelled and the
    /// remaining records are written to the offline queue.
    pub async fn shutdown_flush(&self, timeout: Duration) -> FlushReport {
        let deadline = CancellationToken::new();
        let timer = {
            let deadline = deadline.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                deadline.cancel();
            })
        };

        let report = self.flush_now(&deadline).await;
        timer.abort();

        if deadline.is_cancelled() {
            warn!(
                "Final flush hit the {:?} deadline, queued {} executions",
                timeout, report.queued
            );
        }
        report
    }
}

/// Failures that would repeat for the same payload no matter how often it is
/// sent.
fn is_rejection(failure: Option<FailureKind>) -> bool {
    matches!(failure, Some(FailureKind::Permanent | FailureKind::Encoding))
}
