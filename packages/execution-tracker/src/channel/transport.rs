//! Push transport abstraction for production and testing.
//!
//! Provides a trait-based transport that allows swapping between a real NATS
//! subscription and a scripted test transport.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use crate::events::ExecutionEvent;
use crate::types::ExecutionId;

/// Subject prefix for execution event subjects: `<prefix>.<id>.events`.
pub const DEFAULT_SUBJECT_PREFIX: &str = "executions";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("subscription dropped: {0}")]
    Dropped(String),

    #[error("undecodable event payload: {0}")]
    Decode(String),
}

/// Live events for one execution. The stream ending means the subscription dropped.
pub type EventStream = BoxStream<'static, Result<ExecutionEvent, TransportError>>;

/// Trait for subscribing to execution events.
#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn subscribe(&self, execution_id: &ExecutionId) -> Result<EventStream, TransportError>;
}

/// Decode one JSON payload into an event.
pub fn decode_event(payload: &[u8]) -> Result<ExecutionEvent, TransportError> {
    serde_json::from_slice(payload).map_err(|e| TransportError::Decode(e.to_string()))
}

/// Real NATS transport.
pub struct NatsTransport {
    client: async_nats::Client,
    subject_prefix: String,
}

impl NatsTransport {
    pub fn new(client: async_nats::Client) -> Self {
        Self {
            client,
            subject_prefix: DEFAULT_SUBJECT_PREFIX.to_string(),
        }
    }

    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;
        Ok(Self::new(client))
    }

    pub fn with_subject_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.subject_prefix = prefix.into();
        self
    }

    pub fn subject_for(&self, execution_id: &ExecutionId) -> String {
        format!("{}.{}.events", self.subject_prefix, execution_id)
    }
}

#[async_trait]
impl EventTransport for NatsTransport {
    async fn subscribe(&self, execution_id: &ExecutionId) -> Result<EventStream, TransportError> {
        let subject = self.subject_for(execution_id);
        let subscriber = self
            .client
            .subscribe(subject.clone())
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;

        debug!(%subject, "subscribed to execution events");
        Ok(subscriber
            .map(|message| decode_event(&message.payload))
            .boxed())
    }
}

type SessionItem = Result<ExecutionEvent, TransportError>;

/// Sending half of one scripted subscription.
///
/// Dropping (or closing) the session ends the subscriber's stream, which the
/// adapter treats as a channel drop.
pub struct TestSession {
    tx: mpsc::UnboundedSender<SessionItem>,
}

impl TestSession {
    /// Deliver an event. Returns false once the subscriber is gone.
    pub fn send(&self, event: ExecutionEvent) -> bool {
        self.tx.send(Ok(event)).is_ok()
    }

    /// Deliver a raw message payload as the NATS transport would decode it.
    pub fn send_raw(&self, payload: Bytes) -> bool {
        self.tx.send(decode_event(&payload)).is_ok()
    }

    pub fn send_error(&self, error: TransportError) -> bool {
        self.tx.send(Err(error)).is_ok()
    }

    pub fn close(self) {}
}

#[derive(Default)]
struct TestTransportState {
    sessions: VecDeque<mpsc::UnboundedReceiver<SessionItem>>,
    refusals: usize,
    subscriptions: Vec<ExecutionId>,
}

/// Scripted transport for tests.
///
/// Each `subscribe` call consumes the oldest session opened with
/// [`open_session`](Self::open_session). Without a session, or while refusals
/// are pending, `subscribe` fails with `Unavailable`.
#[derive(Default)]
pub struct TestTransport {
    state: Mutex<TestTransportState>,
}

impl TestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the next successful subscription.
    pub fn open_session(&self) -> TestSession {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .sessions
            .push_back(rx);
        TestSession { tx }
    }

    /// Fail the next `count` subscription attempts.
    pub fn refuse_next(&self, count: usize) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).refusals += count;
    }

    /// Every subscription attempt, successful or not.
    pub fn subscriptions(&self) -> Vec<ExecutionId> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .subscriptions
            .clone()
    }

    pub fn subscription_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .subscriptions
            .len()
    }
}

#[async_trait]
impl EventTransport for TestTransport {
    async fn subscribe(&self, execution_id: &ExecutionId) -> Result<EventStream, TransportError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.subscriptions.push(execution_id.clone());

        if state.refusals > 0 {
            state.refusals -= 1;
            return Err(TransportError::Unavailable("connection refused".into()));
        }

        match state.sessions.pop_front() {
            Some(rx) => Ok(UnboundedReceiverStream::new(rx).boxed()),
            None => Err(TransportError::Unavailable("no session available".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    #[test]
    fn decodes_progress_payload() {
        let event = decode_event(
            br#"{"sequence":3,"timestamp":"2024-05-01T10:00:03Z","type":"progress","counters":{"items_processed":5}}"#,
        )
        .unwrap();
        assert_eq!(event.sequence, 3);
        assert!(matches!(event.kind, EventKind::Progress { .. }));
    }

    #[test]
    fn decode_failure_is_reported_not_panicked() {
        let err = decode_event(b"not json").unwrap_err();
        assert!(matches!(err, TransportError::Decode(_)));
    }

    #[tokio::test]
    async fn test_transport_delivers_session_events() {
        let transport = TestTransport::new();
        let session = transport.open_session();
        let id = ExecutionId::new("exec-1");

        let mut stream = transport.subscribe(&id).await.unwrap();
        session.send(ExecutionEvent::new(1, EventKind::Paused));
        session.close();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.sequence, 1);
        assert!(stream.next().await.is_none());
        assert_eq!(transport.subscriptions(), vec![id]);
    }

    #[tokio::test]
    async fn test_transport_refuses_then_accepts() {
        let transport = TestTransport::new();
        let _session = transport.open_session();
        transport.refuse_next(1);
        let id = ExecutionId::new("exec-1");

        assert!(matches!(
            transport.subscribe(&id).await,
            Err(TransportError::Unavailable(_))
        ));
        assert!(transport.subscribe(&id).await.is_ok());
        assert!(transport.subscribe(&id).await.is_err());
        assert_eq!(transport.subscription_count(), 3);
    }
}
