//! Delivery of encoded batches to the collection service.
//!
//! [`Transport`] is the seam between the retry loop and the network. The
//! production implementation is [`HttpTransport`]; tests substitute a
//! scripted one.
//!
//! # Status classification
//!
//! | Response | Result |
//! |----------|--------|
//! | 2xx | Success, optional `{ "receiptId", "accepted" }` body |
//! | 408, 429, 5xx | [`TransportError::Transient`] |
//! | other 4xx and anything else | [`TransportError::Permanent`] |
//! | connect, timeout, body errors | [`TransportError::Transient`] |

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::Deserialize;
use tracing::debug;

use crate::config::TelemetryConfig;
use crate::error::{TelemetryError, TelemetryResult};

/// Value of the `User-Agent` header.
pub const USER_AGENT: &str = concat!("testpulse/", env!("CARGO_PKG_VERSION"));

/// Header carrying the project identifier.
pub const PROJECT_HEADER: &str = "x-project-id";

/// An encoded batch ready to send.
#[derive(Debug, Clone)]
pub struct EncodedBatch {
    pub body: Vec<u8>,
    pub gzip: bool,
    pub record_count: usize,
}

/// What the service said about an accepted batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReceipt {
    #[serde(default)]
    pub receipt_id: Option<String>,
    #[serde(default)]
    pub accepted: Option<usize>,
}

/// Errors from a single delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Worth retrying: network trouble, timeouts, throttling, 5xx.
    #[error("transient: {0}")]
    Transient(String),

    /// Retrying will not help: authentication or request rejected.
    #[error("permanent: {0}")]
    Permanent(String),

    /// The attempt was abandoned because shutdown was requested.
    #[error("cancelled")]
    Cancelled,
}

/// Sends one encoded batch.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, batch: &EncodedBatch) -> Result<UploadReceipt, TransportError>;
}

/// Classifies a non-success HTTP status.
pub fn classify_status(status: u16, body: &str) -> TransportError {
    let detail = if body.trim().is_empty() {
        format!("HTTP {}", status)
    } else {
        format!("HTTP {}: {}", status, truncate(body.trim(), 200))
    };
    match status {
        408 | 429 | 500..=599 => TransportError::Transient(detail),
        _ => TransportError::Permanent(detail),
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Posts batches to the configured endpoint with reqwest.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: reqwest::Url,
}

impl HttpTransport {
    /// Builds a transport authenticated for the configured project.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InvalidArgument`] if the endpoint or
    /// credentials cannot be used in a request.
    pub fn from_config(config: &TelemetryConfig) -> TelemetryResult<Self> {
        let endpoint = reqwest::Url::parse(&config.api_endpoint).map_err(|e| {
            TelemetryError::invalid(format!("invalid api_endpoint '{}': {}", config.api_endpoint, e))
        })?;

        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
            .map_err(|_| TelemetryError::invalid("api_key contains characters not allowed in a header"))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(
            PROJECT_HEADER,
            HeaderValue::from_str(&config.project_id)
                .map_err(|_| TelemetryError::invalid("project_id contains characters not allowed in a header"))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .build()
            .map_err(|e| TelemetryError::Permanent(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, batch: &EncodedBatch) -> Result<UploadReceipt, TransportError> {
        let mut request = self.client.post(self.endpoint.clone()).body(batch.body.clone());
        if batch.gzip {
            request = request.header(CONTENT_ENCODING, "gzip");
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Transient(format!("request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Transient(format!("failed to read response: {}", e)))?;

        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &body));
        }

        debug!("Endpoint answered {} for {} records", status, batch.record_count);
        // A 2xx without a parseable receipt still counts as accepted.
        Ok(serde_json::from_str(&body).unwrap_or_default())
    }
}
