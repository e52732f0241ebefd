//! Subscription pump with bounded reconnection.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::transport::{EventStream, EventTransport, TransportError};
use super::ChannelSignal;
use crate::backoff::Backoff;
use crate::config::TrackerConfig;
use crate::error::TrackerError;
use crate::runtime::TrackerInput;
use crate::types::ExecutionId;

/// Turns a push subscription into `TrackerInput`s on the tracker's queue.
///
/// The adapter never touches the view: events and lifecycle signals are
/// forwarded and the runtime decides what they mean.
pub struct ChannelAdapter {
    transport: Arc<dyn EventTransport>,
    backoff: Backoff,
    max_attempts: u32,
}

impl ChannelAdapter {
    pub fn new(transport: Arc<dyn EventTransport>, config: &TrackerConfig) -> Self {
        Self {
            transport,
            backoff: config.reconnect_backoff(),
            max_attempts: config.reconnect_max_attempts,
        }
    }

    /// Subscribe to an execution's events and start forwarding them.
    ///
    /// Fails with `ChannelUnavailable` if the first subscription attempt fails;
    /// later drops are handled by the pump.
    pub async fn connect(
        &self,
        execution_id: &ExecutionId,
        sink: mpsc::Sender<TrackerInput>,
        cancel: &CancellationToken,
    ) -> Result<ConnectionHandle, TrackerError> {
        let stream = self.transport.subscribe(execution_id).await.map_err(|e| {
            TrackerError::ChannelUnavailable {
                execution_id: execution_id.clone(),
                reason: e.to_string(),
            }
        })?;

        info!(execution_id = %execution_id, "event channel connected");
        let _ = sink
            .send(TrackerInput::Channel(ChannelSignal::Connected))
            .await;

        Ok(self.spawn_pump(execution_id.clone(), Some(stream), sink, cancel))
    }

    /// Keep retrying in the background after a failed [`connect`](Self::connect).
    pub fn spawn_reconnect(
        &self,
        execution_id: &ExecutionId,
        sink: mpsc::Sender<TrackerInput>,
        cancel: &CancellationToken,
    ) -> ConnectionHandle {
        self.spawn_pump(execution_id.clone(), None, sink, cancel)
    }

    fn spawn_pump(
        &self,
        execution_id: ExecutionId,
        stream: Option<EventStream>,
        sink: mpsc::Sender<TrackerInput>,
        cancel: &CancellationToken,
    ) -> ConnectionHandle {
        let cancel = cancel.child_token();
        let pump = Pump {
            transport: self.transport.clone(),
            backoff: self.backoff,
            max_attempts: self.max_attempts,
            execution_id,
            sink,
            cancel: cancel.clone(),
        };

        ConnectionHandle {
            cancel,
            task: Some(tokio::spawn(pump.run(stream))),
        }
    }
}

/// Owns the pump task. Closing or dropping the handle releases the subscription.
pub struct ConnectionHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ConnectionHandle {
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Close and wait for the pump task to exit.
    pub async fn join(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Pump {
    transport: Arc<dyn EventTransport>,
    backoff: Backoff,
    max_attempts: u32,
    execution_id: ExecutionId,
    sink: mpsc::Sender<TrackerInput>,
    cancel: CancellationToken,
}

impl Pump {
    async fn run(self, initial: Option<EventStream>) {
        let mut stream = match initial {
            Some(stream) => stream,
            None => match self.reconnect().await {
                Some(stream) => stream,
                None => return,
            },
        };

        loop {
            let Some(reason) = self.forward(&mut stream).await else {
                break;
            };

            warn!(execution_id = %self.execution_id, %reason, "event channel dropped");
            if !self.signal(ChannelSignal::Dropped { reason }).await {
                break;
            }

            stream = match self.reconnect().await {
                Some(stream) => stream,
                None => break,
            };
        }

        debug!(execution_id = %self.execution_id, "event pump stopped");
    }

    /// Forward events until the subscription drops. Returns the drop reason,
    /// or `None` when the pump was cancelled or the tracker went away.
    async fn forward(&self, stream: &mut EventStream) -> Option<String> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                item = stream.next() => match item {
                    Some(Ok(event)) => {
                        if self.sink.send(TrackerInput::Event(event)).await.is_err() {
                            return None;
                        }
                    }
                    Some(Err(TransportError::Decode(reason))) => {
                        warn!(execution_id = %self.execution_id, %reason, "skipping undecodable event");
                    }
                    Some(Err(e)) => return Some(e.to_string()),
                    None => return Some("subscription ended".to_string()),
                },
            }
        }
    }

    /// Resubscribe with capped exponential backoff.
    async fn reconnect(&self) -> Option<EventStream> {
        for attempt in 1..=self.max_attempts {
            if !self.signal(ChannelSignal::Reconnecting { attempt }).await {
                return None;
            }

            let delay = self.backoff.delay(attempt);
            debug!(
                execution_id = %self.execution_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "waiting before reconnect"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            let result = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                result = self.transport.subscribe(&self.execution_id) => result,
            };

            match result {
                Ok(stream) => {
                    info!(execution_id = %self.execution_id, attempt, "event channel reconnected");
                    if !self.signal(ChannelSignal::Reconnected).await {
                        return None;
                    }
                    return Some(stream);
                }
                Err(e) => {
                    warn!(execution_id = %self.execution_id, attempt, error = %e, "reconnect attempt failed");
                }
            }
        }

        warn!(
            execution_id = %self.execution_id,
            attempts = self.max_attempts,
            "reconnect attempts exhausted"
        );
        self.signal(ChannelSignal::Disconnected).await;
        None
    }

    async fn signal(&self, signal: ChannelSignal) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.sink.send(TrackerInput::Channel(signal)).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::TestTransport;
    use crate::events::{EventKind, ExecutionEvent};
    use crate::types::Counters;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::time::Instant;

    fn config(max_attempts: u32) -> TrackerConfig {
        TrackerConfig::default().with_reconnect(max_attempts, 100, 1_000)
    }

    fn progress(seq: u64, count: u64) -> ExecutionEvent {
        ExecutionEvent::new(
            seq,
            EventKind::Progress {
                counters: Counters::processed(count),
                phase: None,
            },
        )
    }

    async fn next_signal(rx: &mut mpsc::Receiver<TrackerInput>) -> ChannelSignal {
        match rx.recv().await {
            Some(TrackerInput::Channel(signal)) => signal,
            other => panic!("expected channel signal, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn failed_first_subscription_is_channel_unavailable() {
        let transport = Arc::new(TestTransport::new());
        transport.refuse_next(1);
        let adapter = ChannelAdapter::new(transport, &config(3));
        let (tx, _rx) = mpsc::channel(16);

        let result = adapter
            .connect(&ExecutionId::new("exec-1"), tx, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(TrackerError::ChannelUnavailable { .. })));
    }

    #[tokio::test]
    async fn forwards_events_in_arrival_order() {
        let transport = Arc::new(TestTransport::new());
        let session = transport.open_session();
        let adapter = ChannelAdapter::new(transport, &config(3));
        let (tx, mut rx) = mpsc::channel(16);

        let _handle = adapter
            .connect(&ExecutionId::new("exec-1"), tx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(next_signal(&mut rx).await, ChannelSignal::Connected);

        session.send(progress(2, 1));
        session.send_raw(Bytes::from_static(b"{garbage"));
        session.send(progress(1, 0));

        for expected in [2, 1] {
            match rx.recv().await {
                Some(TrackerInput::Event(event)) => assert_eq!(event.sequence, expected),
                other => panic!("expected event, got {:?}", other),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn drop_triggers_reconnect_and_resync_signal() {
        let transport = Arc::new(TestTransport::new());
        let first = transport.open_session();
        let adapter = ChannelAdapter::new(transport.clone(), &config(3));
        let (tx, mut rx) = mpsc::channel(16);

        let _handle = adapter
            .connect(&ExecutionId::new("exec-1"), tx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(next_signal(&mut rx).await, ChannelSignal::Connected);

        let second = transport.open_session();
        first.close();

        assert!(matches!(next_signal(&mut rx).await, ChannelSignal::Dropped { .. }));
        assert_eq!(
            next_signal(&mut rx).await,
            ChannelSignal::Reconnecting { attempt: 1 }
        );
        assert_eq!(next_signal(&mut rx).await, ChannelSignal::Reconnected);

        second.send(progress(5, 10));
        assert!(matches!(rx.recv().await, Some(TrackerInput::Event(_))));
        assert_eq!(transport.subscription_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_attempts_report_disconnected_after_backoff() {
        let transport = Arc::new(TestTransport::new());
        let session = transport.open_session();
        let adapter = ChannelAdapter::new(transport.clone(), &config(3));
        let (tx, mut rx) = mpsc::channel(16);

        let _handle = adapter
            .connect(&ExecutionId::new("exec-1"), tx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(next_signal(&mut rx).await, ChannelSignal::Connected);

        let dropped_at = Instant::now();
        session.close();
        assert!(matches!(next_signal(&mut rx).await, ChannelSignal::Dropped { .. }));

        for attempt in 1..=3 {
            assert_eq!(
                next_signal(&mut rx).await,
                ChannelSignal::Reconnecting { attempt }
            );
        }
        assert_eq!(next_signal(&mut rx).await, ChannelSignal::Disconnected);

        // 100ms + 200ms + 400ms
        assert!(dropped_at.elapsed() >= Duration::from_millis(700));
        assert_eq!(transport.subscription_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn background_reconnect_after_failed_connect() {
        let transport = Arc::new(TestTransport::new());
        transport.refuse_next(1);
        let adapter = ChannelAdapter::new(transport.clone(), &config(3));
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let id = ExecutionId::new("exec-1");

        assert!(adapter.connect(&id, tx.clone(), &cancel).await.is_err());

        let _session = transport.open_session();
        let _handle = adapter.spawn_reconnect(&id, tx, &cancel);

        assert_eq!(
            next_signal(&mut rx).await,
            ChannelSignal::Reconnecting { attempt: 1 }
        );
        assert_eq!(next_signal(&mut rx).await, ChannelSignal::Reconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn closing_handle_stops_the_pump() {
        let transport = Arc::new(TestTransport::new());
        let session = transport.open_session();
        let adapter = ChannelAdapter::new(transport.clone(), &config(3));
        let (tx, mut rx) = mpsc::channel(16);

        let handle = adapter
            .connect(&ExecutionId::new("exec-1"), tx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(next_signal(&mut rx).await, ChannelSignal::Connected);

        handle.join().await;
        assert!(!session.send(progress(1, 1)));
        // The pump held the last sender
        assert!(rx.recv().await.is_none());
    }
}
