//! Upload outcome notifications.

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::{FailureKind, UploadResult};

/// Receives the outcome of every upload.
#[async_trait]
pub trait UploadObserver: Send + Sync {
    /// Called after the service accepted a batch.
    async fn on_upload_succeeded(&self, result: &UploadResult);

    /// Called after a batch failed for good (retries exhausted, rejected,
    /// or cancelled).
    async fn on_upload_failed(&self, result: &UploadResult);
}

/// An observer that does nothing.
pub struct NullObserver;

#[async_trait]
impl UploadObserver for NullObserver {
    async fn on_upload_succeeded(&self, _result: &UploadResult) {}
    async fn on_upload_failed(&self, _result: &UploadResult) {}
}

/// Writes upload outcomes to the `tracing` log.
pub struct LoggingObserver;

#[async_trait]
impl UploadObserver for LoggingObserver {
    async fn on_upload_succeeded(&self, result: &UploadResult) {
        info!(
            batch = %result.batch_id,
            receipt = result.receipt_id.as_deref().unwrap_or("-"),
            "Uploaded {} executions ({} bytes) in {:?}",
            result.accepted_count,
            result.payload_bytes,
            result.duration
        );
    }

    async fn on_upload_failed(&self, result: &UploadResult) {
        let message = result.error.as_deref().unwrap_or("unknown error");
        match result.failure {
            Some(FailureKind::Permanent) | Some(FailureKind::Encoding) => error!(
                batch = %result.batch_id,
                "Upload rejected after {} attempt(s): {}",
                result.attempts,
                message
            ),
            _ => warn!(
                batch = %result.batch_id,
                "Upload failed after {} attempt(s): {}",
                result.attempts,
                message
            ),
        }
    }
}

/// Fans each event out to several observers, in registration order.
pub struct MultiObserver {
    observers: Vec<Box<dyn UploadObserver>>,
}

impl MultiObserver {
    pub fn new() -> Self {
        Self {
            observers: Vec::new(),
        }
    }

    /// Adds an observer.
    pub fn with_observer<O: UploadObserver + 'static>(mut self, observer: O) -> Self {
        self.observers.push(Box::new(observer));
        self
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl Default for MultiObserver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UploadObserver for MultiObserver {
    async fn on_upload_succeeded(&self, result: &UploadResult) {
        for observer in &self.observers {
            observer.on_upload_succeeded(result).await;
        }
    }

    async fn on_upload_failed(&self, result: &UploadResult) {
        for observer in &self.observers {
            observer.on_upload_failed(result).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        succeeded: Arc<AtomicUsize>,
        failed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl UploadObserver for Counting {
        async fn on_upload_succeeded(&self, _result: &UploadResult) {
            self.succeeded.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_upload_failed(&self, _result: &UploadResult) {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_multi_observer_fans_out() {
        let succeeded = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        let multi = MultiObserver::new()
            .with_observer(Counting {
                succeeded: succeeded.clone(),
                failed: failed.clone(),
            })
            .with_observer(LoggingObserver)
            .with_observer(Counting {
                succeeded: succeeded.clone(),
                failed: failed.clone(),
            });
        assert_eq!(multi.len(), 3);

        let ok = UploadResult::empty();
        multi.on_upload_succeeded(&ok).await;
        let mut bad = UploadResult::empty();
        bad.success = false;
        bad.failure = Some(FailureKind::Transient);
        multi.on_upload_failed(&bad).await;

        assert_eq!(succeeded.load(Ordering::SeqCst), 2);
        assert_eq!(failed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_null_observer() {
        NullObserver.on_upload_failed(&UploadResult::empty()).await;
        assert!(MultiObserver::default().is_empty());
    }
}
