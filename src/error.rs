//! Error types shared by the telemetry pipeline.
//!
//! Every failure inside the pipeline maps onto one of a small set of
//! [`ErrorKind`]s. The kind decides what happens next:
//!
//! | Kind | Origin | Handling |
//! |------|--------|----------|
//! | `InvalidArgument` | Malformed identity or record input | Fails fast, caller's bug |
//! | `Transient` | Network errors, 5xx, timeouts | Retried, then offline-queued |
//! | `Permanent` | Auth or validation rejection | Not retried, surfaced via observers |
//! | `Storage` | Offline queue I/O | Logged, pipeline keeps running |
//!
//! Upload attempts are classified by [`crate::upload::TransportError`] and
//! reported as a [`crate::upload::FailureKind`] rather than raised, so the
//! retry loop never sees a `TelemetryError`.
//!
//! Probes that cannot determine a value do not produce errors at all; they
//! return explicit unknown values (see [`crate::network::Reachability`]).

/// Result type for pipeline operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;

/// Errors produced by the telemetry pipeline.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// Input that can never succeed (empty names, out-of-range settings).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A failure that may succeed on retry.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// A failure the remote side will keep rejecting.
    #[error("Permanent failure: {0}")]
    Permanent(String),

    /// Offline queue storage failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O error reading or writing local files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to encode or decode a record.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse classification of a [`TelemetryError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    Transient,
    Permanent,
    Storage,
}

impl TelemetryError {
    /// Shorthand for an [`TelemetryError::InvalidArgument`] error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Returns the kind this error belongs to.
    ///
    /// I/O and serialization failures only happen on the local storage path,
    /// so they classify as [`ErrorKind::Storage`].
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::Transient(_) => ErrorKind::Transient,
            Self::Permanent(_) => ErrorKind::Permanent,
            Self::Storage(_) | Self::Io(_) | Self::Serialization(_) => ErrorKind::Storage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            TelemetryError::invalid("empty name").kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            TelemetryError::Transient("503".into()).kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            TelemetryError::Permanent("401".into()).kind(),
            ErrorKind::Permanent
        );
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(TelemetryError::from(io).kind(), ErrorKind::Storage);
    }

    #[test]
    fn test_display_includes_message() {
        let err = TelemetryError::invalid("assembly must not be empty");
        assert_eq!(
            err.to_string(),
            "Invalid argument: assembly must not be empty"
        );
    }
}
