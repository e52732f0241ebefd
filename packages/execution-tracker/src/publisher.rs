//! Fan-out of immutable view copies to observers.
//!
//! The runtime publishes after every accepted mutation; each subscriber has
//! its own unbounded queue so a slow observer never stalls reconciliation and
//! never misses an intermediate view. Subscribe before reading
//! [`ViewPublisher::current`] to avoid missing an update in between.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, RwLock, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::view::ExecutionView;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

type ViewSender = mpsc::UnboundedSender<Arc<ExecutionView>>;

struct PublisherState {
    current: Arc<ExecutionView>,
    subscribers: HashMap<SubscriptionId, ViewSender>,
    next_id: u64,
    closed: bool,
}

#[derive(Clone)]
pub struct ViewPublisher {
    state: Arc<RwLock<PublisherState>>,
}

impl ViewPublisher {
    pub fn new(initial: ExecutionView) -> Self {
        Self {
            state: Arc::new(RwLock::new(PublisherState {
                current: Arc::new(initial),
                subscribers: HashMap::new(),
                next_id: 1,
                closed: false,
            })),
        }
    }

    /// Latest published view.
    pub fn current(&self) -> Arc<ExecutionView> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .current
            .clone()
    }

    /// Register for every view published from now on.
    ///
    /// After [`close`](Self::close) the subscription is already finished.
    pub fn subscribe(&self) -> ViewSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let id = SubscriptionId(state.next_id);
        state.next_id += 1;
        if !state.closed {
            state.subscribers.insert(id, tx);
        }

        ViewSubscription {
            id,
            receiver: rx,
            publisher: Arc::downgrade(&self.state),
        }
    }

    /// Stop delivering to a subscription. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .subscribers
            .remove(&id)
            .is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .subscribers
            .len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().unwrap_or_else(|e| e.into_inner()).closed
    }

    /// Replace the current view and deliver it to every subscriber.
    ///
    /// Views that are not newer than the current one, or that would regress
    /// the status, are not published.
    pub(crate) fn publish(&self, view: ExecutionView) -> bool {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return false;
        }
        if view.revision <= state.current.revision {
            debug!(
                execution_id = %view.execution_id,
                revision = view.revision,
                current = state.current.revision,
                "skipping view that is not newer"
            );
            return false;
        }
        if view.status.rank() < state.current.status.rank() {
            warn!(
                execution_id = %view.execution_id,
                status = %view.status,
                current = %state.current.status,
                "refusing to publish status regression"
            );
            return false;
        }

        let view = Arc::new(view);
        state.current = view.clone();
        state
            .subscribers
            .retain(|_, tx| tx.send(view.clone()).is_ok());
        true
    }

    /// Finish every subscription. Later publishes are ignored.
    pub(crate) fn close(&self) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.closed = true;
        state.subscribers.clear();
    }
}

/// Receiving side of one registration. Dropping it unsubscribes.
pub struct ViewSubscription {
    id: SubscriptionId,
    receiver: mpsc::UnboundedReceiver<Arc<ExecutionView>>,
    publisher: Weak<RwLock<PublisherState>>,
}

impl ViewSubscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Next published view, or `None` once tracking has stopped.
    pub async fn next(&mut self) -> Option<Arc<ExecutionView>> {
        self.receiver.recv().await
    }

    /// Next already-delivered view, without waiting.
    pub fn try_next(&mut self) -> Option<Arc<ExecutionView>> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for ViewSubscription {
    type Item = Arc<ExecutionView>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for ViewSubscription {
    fn drop(&mut self) {
        if let Some(state) = self.publisher.upgrade() {
            state
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .subscribers
                .remove(&self.id);
        }
    }
}
