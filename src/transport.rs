//! Transport abstraction: the pluggable delivery mechanism for batches.
//!
//! A transport sends a whole batch or fails it as a unit. There is no
//! partial success; a failed batch is re-enqueued by the manager and may be
//! delivered twice if the failure was a false negative.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use uuid::Uuid;

use crate::queue::Batch;

/// Errors reported by a transport for a failed batch.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request never produced a response
    #[error("Request failed: {0}")]
    Request(String),

    /// The backend answered with an error status code
    #[error("Server error ({code}): {message}")]
    Status { code: u16, message: String },

    /// An event attribute cannot be represented in the wire format.
    /// `sequence` identifies the offending event inside the batch.
    #[error("Event '{event}' attribute '{key}' cannot be encoded: {reason}")]
    Encoding {
        event: String,
        key: String,
        reason: String,
        sequence: u64,
    },

    /// Request timeout
    #[error("Request timed out")]
    Timeout,

    /// The backend answered but refused the batch
    #[error("Batch rejected: {0}")]
    Rejected(String),

    /// All retry attempts inside a single send exhausted
    #[error("All {attempts} send attempts exhausted. Last error: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// Transport configuration error
    #[error("Transport configuration error: {0}")]
    Config(String),
}

impl TransportError {
    /// Whether the error concerns the content of the batch rather than
    /// delivery.
    pub fn is_encoding(&self) -> bool {
        matches!(self, TransportError::Encoding { .. })
    }
}

/// Delivery mechanism consumed by the manager.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Maximum number of events passed to a single `send`. Must be positive
    /// and constant for the lifetime of the transport.
    fn batch_size(&self) -> usize;

    /// Deliver `batch` on behalf of `user_id`.
    ///
    /// Must not keep references to the batch past the call and must report
    /// the outcome for the batch as a whole.
    async fn send(&self, batch: &Batch, user_id: Uuid) -> Result<(), TransportError>;
}

/// Accepts every batch without delivering it anywhere.
///
/// Useful when analytics is disabled but a manager is still required.
#[derive(Debug, Clone)]
pub struct NoopTransport {
    batch_size: usize,
}

impl NoopTransport {
    pub fn new(batch_size: usize) -> Self {
        Self { batch_size }
    }
}

impl Default for NoopTransport {
    fn default() -> Self {
        Self { batch_size: 50 }
    }
}

#[async_trait]
impl Transport for NoopTransport {
    fn batch_size(&self) -> usize {
        self.batch_size
    }

    async fn send(&self, batch: &Batch, _user_id: Uuid) -> Result<(), TransportError> {
        tracing::debug!(batch_size = batch.len(), "Noop transport discarded batch");
        Ok(())
    }
}

/// What an `InMemoryTransport` saw of one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub name: String,
    pub occurred_at: DateTime<Utc>,
    pub sequence: u64,
}

/// One `send` call observed by an `InMemoryTransport`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedSend {
    pub user_id: Uuid,
    pub events: Vec<RecordedEvent>,
    pub succeeded: bool,
}

impl RecordedSend {
    pub fn names(&self) -> Vec<String> {
        self.events.iter().map(|e| e.name.clone()).collect()
    }
}

#[derive(Default)]
struct InMemoryState {
    sends: Vec<RecordedSend>,
    failures_remaining: usize,
}

/// Records every send attempt; can be scripted to fail.
///
/// Intended for tests and for hosts that want to inspect traffic.
pub struct InMemoryTransport {
    batch_size: usize,
    delay: Option<Duration>,
    state: Mutex<InMemoryState>,
}

impl InMemoryTransport {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            delay: None,
            state: Mutex::new(InMemoryState::default()),
        }
    }

    /// Sleep for `delay` inside every send, to widen race windows.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make the next `count` sends fail.
    pub fn fail_next(&self, count: usize) {
        self.state.lock().failures_remaining = count;
    }

    /// Every send attempt, successful or not, in call order.
    pub fn attempts(&self) -> Vec<RecordedSend> {
        self.state.lock().sends.clone()
    }

    /// Successful sends only.
    pub fn delivered(&self) -> Vec<RecordedSend> {
        self.state
            .lock()
            .sends
            .iter()
            .filter(|s| s.succeeded)
            .cloned()
            .collect()
    }

    pub fn send_count(&self) -> usize {
        self.state.lock().sends.len()
    }

    /// Total number of events across successful sends.
    pub fn delivered_event_count(&self) -> usize {
        self.delivered().iter().map(|s| s.events.len()).sum()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn batch_size(&self) -> usize {
        self.batch_size
    }

    async fn send(&self, batch: &Batch, user_id: Uuid) -> Result<(), TransportError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let events = batch
            .iter()
            .map(|e| RecordedEvent {
                name: e.name().to_string(),
                occurred_at: e.occurred_at(),
                sequence: e.sequence(),
            })
            .collect();

        let mut state = self.state.lock();
        let fail = state.failures_remaining > 0;
        if fail {
            state.failures_remaining -= 1;
        }
        state.sends.push(RecordedSend {
            user_id,
            events,
            succeeded: !fail,
        });

        if fail {
            Err(TransportError::Rejected("scripted failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{CustomEvent, TimestampedEvent};
    use std::sync::Arc;

    fn create_test_batch(size: usize) -> Batch {
        let events = (0..size)
            .map(|i| {
                TimestampedEvent::new(
                    Arc::new(CustomEvent::new(format!("event-{}", i)).unwrap()),
                    Utc::now(),
                )
            })
            .collect();
        Batch::new(events)
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::Timeout;
        assert_eq!(format!("{}", err), "Request timed out");

        let err = TransportError::Status {
            code: 400,
            message: "Invalid JSON".to_string(),
        };
        assert!(format!("{}", err).contains("400"));
        assert!(format!("{}", err).contains("Invalid JSON"));

        let err = TransportError::Encoding {
            event: "purchase".to_string(),
            key: "amount".to_string(),
            reason: "NaN".to_string(),
            sequence: 3,
        };
        assert!(err.is_encoding());
        assert!(format!("{}", err).contains("purchase"));
        assert!(format!("{}", err).contains("amount"));
    }

    #[tokio::test]
    async fn test_noop_transport_accepts_everything() {
        let transport = NoopTransport::new(5);
        assert_eq!(transport.batch_size(), 5);
        assert!(transport.send(&create_test_batch(3), Uuid::new_v4()).await.is_ok());
    }

    #[tokio::test]
    async fn test_in_memory_transport_records_sends() {
        let transport = InMemoryTransport::new(10);
        let user_id = Uuid::new_v4();

        transport.send(&create_test_batch(2), user_id).await.unwrap();

        let delivered = transport.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].user_id, user_id);
        assert_eq!(delivered[0].names(), vec!["event-0", "event-1"]);
        assert_eq!(transport.delivered_event_count(), 2);
    }

    #[tokio::test]
    async fn test_in_memory_transport_scripted_failures() {
        let transport = InMemoryTransport::new(10);
        transport.fail_next(2);

        let batch = create_test_batch(1);
        assert!(transport.send(&batch, Uuid::nil()).await.is_err());
        assert!(transport.send(&batch, Uuid::nil()).await.is_err());
        assert!(transport.send(&batch, Uuid::nil()).await.is_ok());

        assert_eq!(transport.send_count(), 3);
        assert_eq!(transport.delivered().len(), 1);
        assert!(!transport.attempts()[0].succeeded);
    }
}
