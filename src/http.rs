//! HTTP transport sending event batches as JSON.
//!
//! `HttpTransport` posts each batch once, then repeats the same payload
//! (same `batch_id`) while the endpoint looks temporarily unavailable.
//! Anything the endpoint refuses outright, and a batch that is still
//! failing after the last retry, is reported to the manager, which
//! re-enqueues the events for the next trigger.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::attribute::Attributes;
use crate::config::Config;
use crate::queue::Batch;
use crate::transport::{Transport, TransportError};

/// Delay before the first retry of a batch.
const FIRST_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Upper bound for the delay between two attempts.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Response from the ingestion endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestResponse {
    /// Status message from the API
    pub status: String,

    /// Number of events accepted
    #[serde(default)]
    pub accepted: u64,

    /// Number of events rejected (if any)
    #[serde(default)]
    pub rejected: u64,

    /// Optional error message
    #[serde(default)]
    pub error: Option<String>,
}

/// Request body for one batch.
#[derive(Debug, Serialize)]
pub struct BatchPayload<'a> {
    /// Client-generated id, lets the backend drop duplicate deliveries
    pub batch_id: Uuid,
    pub user_id: Uuid,
    pub events: Vec<EventPayload<'a>>,
}

/// One event inside a `BatchPayload`.
#[derive(Debug, Serialize)]
pub struct EventPayload<'a> {
    pub event: &'a str,
    pub time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<&'a Attributes>,
}

/// Build the request body for `batch`.
///
/// # Errors
///
/// Returns `TransportError::Encoding` naming the first event and attribute
/// that has no JSON form. serde_json would otherwise write such floats as
/// `null`.
pub fn encode_batch(batch: &Batch, user_id: Uuid) -> Result<BatchPayload<'_>, TransportError> {
    let mut events = Vec::with_capacity(batch.len());

    for queued in batch {
        let event = queued.event();
        let properties = event.attributes();

        if let Some(attributes) = properties {
            if let Some((key, value)) = attributes.iter().find(|(_, v)| !v.is_json_representable()) {
                return Err(TransportError::Encoding {
                    event: event.name().to_string(),
                    key: key.clone(),
                    reason: format!("{} value {} has no JSON representation", value.kind(), value),
                    sequence: queued.sequence(),
                });
            }
        }

        events.push(EventPayload {
            event: event.name(),
            time: queued.occurred_at(),
            properties,
        });
    }

    Ok(BatchPayload {
        batch_id: Uuid::new_v4(),
        user_id,
        events,
    })
}

/// Failure of one POST of a batch payload.
#[derive(Debug, Error)]
pub enum HttpError {
    /// No response: connection refused, DNS, TLS or timeout
    #[error("request to ingestion endpoint failed: {0}")]
    Request(#[source] reqwest::Error),

    /// The endpoint answered with a non-success status
    #[error("ingestion endpoint answered {status}: {body}")]
    Status { status: StatusCode, body: String },

    /// The endpoint accepted the request but dropped some events
    #[error("{rejected} of {sent} events rejected: {reason}")]
    EventsRejected {
        rejected: u64,
        sent: usize,
        reason: String,
    },

    /// The success body could not be parsed
    #[error("unreadable ingest response: {0}")]
    UnreadableResponse(#[source] serde_json::Error),
}

impl HttpError {
    /// Whether posting the same payload again may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            HttpError::Request(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            HttpError::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            HttpError::EventsRejected { .. } | HttpError::UnreadableResponse(_) => false,
        }
    }
}

impl From<HttpError> for TransportError {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::Request(e) if e.is_timeout() => TransportError::Timeout,
            HttpError::Request(e) => TransportError::Request(e.to_string()),
            HttpError::Status { status, body } => TransportError::Status {
                code: status.as_u16(),
                message: body,
            },
            other => TransportError::Rejected(other.to_string()),
        }
    }
}

/// Waiting time between attempts at the same batch.
///
/// Doubles per retry starting at `first`, adds up to 25% jitter so clients
/// that failed together do not retry together, and never exceeds `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBackoff {
    first: Duration,
    max: Duration,
}

impl RetryBackoff {
    pub fn new(first: Duration, max: Duration) -> Self {
        Self { first, max }
    }

    /// Delay before retry number `retry`, counting from 1.
    pub fn delay(&self, retry: u32) -> Duration {
        let doublings = retry.saturating_sub(1).min(10);
        let base = self.first.saturating_mul(1 << doublings);
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4);
        base.saturating_add(Duration::from_millis(jitter_ms)).min(self.max)
    }
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::new(FIRST_RETRY_DELAY, MAX_RETRY_DELAY)
    }
}

/// Transport posting JSON batches to an HTTP endpoint.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use telemetry_batcher::config::Config;
/// use telemetry_batcher::http::HttpTransport;
/// use telemetry_batcher::manager::AnalyticsManager;
///
/// let config = Config::default();
/// let transport = HttpTransport::new(&config).expect("Failed to create transport");
/// let manager = AnalyticsManager::builder(Arc::new(transport))
///     .build()
///     .expect("Failed to build manager");
/// ```
pub struct HttpTransport {
    /// Pooled client, shared by every send
    client: Client,

    /// URL receiving the batches
    endpoint: String,

    /// Events per batch
    batch_size: usize,

    /// Extra attempts after the first POST of a batch
    max_retries: u32,

    /// Per-request timeout
    timeout: Duration,

    backoff: RetryBackoff,
}

impl HttpTransport {
    /// Create a transport from the loaded configuration.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Config` if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self, TransportError> {
        Self::with_settings(
            config.endpoint.clone(),
            config.batch_size,
            config.request_timeout,
            config.max_retries,
        )
    }

    /// Create a transport with explicit settings.
    pub fn with_settings(
        endpoint: impl Into<String>,
        batch_size: usize,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Self, TransportError> {
        if batch_size == 0 {
            return Err(TransportError::Config(
                "batch size must be greater than 0".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| TransportError::Config(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            batch_size,
            max_retries,
            timeout,
            backoff: RetryBackoff::default(),
        })
    }

    /// Replace the default retry schedule.
    pub fn with_backoff(mut self, backoff: RetryBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// POST the payload once. Returns the number of events the endpoint
    /// reports as accepted.
    async fn post_batch(&self, payload: &BatchPayload<'_>) -> Result<u64, HttpError> {
        let response = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(payload)
            .send()
            .await
            .map_err(HttpError::Request)?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(HttpError::Status { status, body });
        }

        // An empty body counts as acceptance of the whole batch.
        if body.trim().is_empty() {
            return Ok(payload.events.len() as u64);
        }

        let parsed: IngestResponse =
            serde_json::from_str(&body).map_err(HttpError::UnreadableResponse)?;

        if parsed.rejected > 0 {
            return Err(HttpError::EventsRejected {
                rejected: parsed.rejected,
                sent: payload.events.len(),
                reason: parsed.error.unwrap_or(parsed.status),
            });
        }

        Ok(parsed.accepted)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn batch_size(&self) -> usize {
        self.batch_size
    }

    async fn send(&self, batch: &Batch, user_id: Uuid) -> Result<(), TransportError> {
        let payload = encode_batch(batch, user_id)?;
        let attempts = self.max_retries.saturating_add(1);
        let mut attempt = 1;

        debug!(
            batch_id = %payload.batch_id,
            events = payload.events.len(),
            url = %self.endpoint,
            "Posting event batch"
        );

        loop {
            match self.post_batch(&payload).await {
                Ok(accepted) => {
                    info!(
                        batch_id = %payload.batch_id,
                        events = payload.events.len(),
                        accepted = accepted,
                        attempt = attempt,
                        "Event batch delivered"
                    );
                    return Ok(());
                }
                Err(e) if !e.is_transient() => {
                    error!(batch_id = %payload.batch_id, error = %e, "Event batch refused");
                    return Err(e.into());
                }
                Err(e) if attempt >= attempts => {
                    error!(
                        batch_id = %payload.batch_id,
                        error = %e,
                        attempts = attempts,
                        "Event batch undeliverable for now"
                    );
                    return Err(TransportError::RetriesExhausted {
                        attempts,
                        last_error: e.to_string(),
                    });
                }
                Err(e) => {
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        batch_id = %payload.batch_id,
                        error = %e,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Event batch post failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{CustomEvent, TimestampedEvent};
    use std::sync::Arc;

    fn create_test_batch(events: Vec<CustomEvent>) -> Batch {
        Batch::new(
            events
                .into_iter()
                .map(|e| TimestampedEvent::new(Arc::new(e), Utc::now()))
                .collect(),
        )
    }

    fn create_transport() -> HttpTransport {
        HttpTransport::new(&Config::default()).unwrap()
    }

    #[test]
    fn test_transport_creation() {
        let transport = create_transport();
        assert_eq!(transport.endpoint(), "http://localhost:8000/api/v1/events");
        assert_eq!(transport.batch_size(), 50);
        assert_eq!(transport.max_retries(), 2);
        assert_eq!(transport.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_transport_with_settings() {
        let transport =
            HttpTransport::with_settings("http://example.com/events", 5, Duration::from_secs(60), 4)
                .unwrap();
        assert_eq!(transport.endpoint(), "http://example.com/events");
        assert_eq!(transport.batch_size(), 5);
        assert_eq!(transport.max_retries(), 4);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let result = HttpTransport::with_settings("http://example.com", 0, Duration::from_secs(1), 0);
        assert!(matches!(result, Err(TransportError::Config(_))));
    }

    #[test]
    fn test_encode_batch_payload() {
        let batch = create_test_batch(vec![
            CustomEvent::new("screen_view")
                .unwrap()
                .with_attribute("screen", "settings")
                .with_attribute("depth", 2_i64),
            CustomEvent::new("tap").unwrap(),
        ]);
        let user_id = Uuid::new_v4();

        let payload = encode_batch(&batch, user_id).unwrap();
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["user_id"], user_id.to_string());
        assert_eq!(json["events"][0]["event"], "screen_view");
        assert_eq!(json["events"][0]["properties"]["screen"], "settings");
        assert_eq!(json["events"][0]["properties"]["depth"], 2);
        assert_eq!(json["events"][1]["event"], "tap");
        assert!(json["events"][1].get("properties").is_none());
        assert!(json["events"][0]["time"].is_string());
    }

    #[test]
    fn test_encode_batch_flags_non_finite_float() {
        let batch = create_test_batch(vec![
            CustomEvent::new("fine").unwrap().with_attribute("x", 1.0),
            CustomEvent::new("broken").unwrap().with_attribute("ratio", f64::NAN),
        ]);

        match encode_batch(&batch, Uuid::nil()) {
            Err(TransportError::Encoding { event, key, sequence, .. }) => {
                assert_eq!(event, "broken");
                assert_eq!(key, "ratio");
                assert_eq!(sequence, batch.events()[1].sequence());
            }
            other => panic!("expected encoding error, got {:?}", other.map(|p| p.events.len())),
        }
    }

    #[test]
    fn test_backoff_doubles_per_retry() {
        let backoff = RetryBackoff::default();

        let first = backoff.delay(1).as_millis();
        let second = backoff.delay(2).as_millis();
        let third = backoff.delay(3).as_millis();

        assert!((500..=625).contains(&first));
        assert!((1000..=1250).contains(&second));
        assert!((2000..=2500).contains(&third));
    }

    #[test]
    fn test_backoff_respects_max() {
        let backoff = RetryBackoff::new(Duration::from_millis(100), Duration::from_millis(300));
        assert!(backoff.delay(8) <= Duration::from_millis(300));
        assert!(RetryBackoff::default().delay(40) <= MAX_RETRY_DELAY);
    }

    #[test]
    fn test_transient_http_errors() {
        let status = |status| HttpError::Status {
            status,
            body: String::new(),
        };

        assert!(status(StatusCode::SERVICE_UNAVAILABLE).is_transient());
        assert!(status(StatusCode::TOO_MANY_REQUESTS).is_transient());
        assert!(!status(StatusCode::BAD_REQUEST).is_transient());
        assert!(!HttpError::EventsRejected {
            rejected: 1,
            sent: 3,
            reason: "schema".to_string(),
        }
        .is_transient());
    }

    #[test]
    fn test_http_error_maps_to_transport_error() {
        let err: TransportError = HttpError::Status {
            status: StatusCode::BAD_GATEWAY,
            body: "upstream down".to_string(),
        }
        .into();
        match err {
            TransportError::Status { code, message } => {
                assert_eq!(code, 502);
                assert_eq!(message, "upstream down");
            }
            other => panic!("unexpected error: {}", other),
        }

        let err: TransportError = HttpError::EventsRejected {
            rejected: 2,
            sent: 5,
            reason: "too old".to_string(),
        }
        .into();
        assert!(matches!(err, TransportError::Rejected(ref m) if m.contains("2 of 5")));
    }

    #[test]
    fn test_ingest_response_deserialization() {
        let json = r#"{"status": "accepted", "accepted": 100, "rejected": 0}"#;
        let response: IngestResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.status, "accepted");
        assert_eq!(response.accepted, 100);
        assert_eq!(response.rejected, 0);
        assert!(response.error.is_none());

        let json = r#"{"status": "accepted"}"#;
        let response: IngestResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.accepted, 0);
    }

    #[tokio::test]
    async fn test_encoding_failure_skips_network() {
        // Nothing listens here; an encoding failure must be reported first.
        let transport =
            HttpTransport::with_settings("http://127.0.0.1:1/events", 5, Duration::from_secs(1), 0)
                .unwrap();
        let batch = create_test_batch(vec![CustomEvent::new("bad")
            .unwrap()
            .with_attribute("v", f64::INFINITY)]);

        let err = transport.send(&batch, Uuid::nil()).await.unwrap_err();
        assert!(err.is_encoding());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails_batch() {
        let transport =
            HttpTransport::with_settings("http://127.0.0.1:1/events", 5, Duration::from_secs(2), 0)
                .unwrap();
        let batch = create_test_batch(vec![CustomEvent::new("ok").unwrap()]);

        let result = transport.send(&batch, Uuid::nil()).await;
        assert!(matches!(
            result,
            Err(TransportError::RetriesExhausted { attempts: 1, .. })
                | Err(TransportError::Request(_))
                | Err(TransportError::Timeout)
        ));
    }
}
