//! Entry point: launch or attach to an execution and get a handle on its view.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use scrape_api_client::{ApiError, ExecutionRun, ScrapeApiClient, StartExecutionInput};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::channel::{ChannelAdapter, ChannelSignal, ConnectionHandle, EventTransport};
use crate::config::TrackerConfig;
use crate::error::TrackerError;
use crate::publisher::{SubscriptionId, ViewPublisher, ViewSubscription};
use crate::runtime::{TrackerInput, TrackerMachine, TrackerRuntime};
use crate::snapshot::{status_from_run, SnapshotSource};
use crate::types::{ExecutionId, ExecutionStatus};
use crate::view::ExecutionView;

/// Starts executions on the remote service.
#[async_trait]
pub trait ExecutionLauncher: Send + Sync {
    async fn start_execution(&self, input: &StartExecutionInput) -> Result<ExecutionRun, ApiError>;
}

#[async_trait]
impl ExecutionLauncher for ScrapeApiClient {
    async fn start_execution(&self, input: &StartExecutionInput) -> Result<ExecutionRun, ApiError> {
        ScrapeApiClient::start_execution(self, input).await
    }
}

/// Creates one independent tracker per execution.
///
/// Trackers share the transport and snapshot source but nothing else: each
/// owns its view, queue, publisher and cancellation token.
pub struct ExecutionTracker {
    config: TrackerConfig,
    transport: Arc<dyn EventTransport>,
    snapshots: Arc<dyn SnapshotSource>,
}

impl ExecutionTracker {
    pub fn new(
        config: TrackerConfig,
        transport: Arc<dyn EventTransport>,
        snapshots: Arc<dyn SnapshotSource>,
    ) -> Result<Self, TrackerError> {
        config.validate()?;
        Ok(Self {
            config,
            transport,
            snapshots,
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Start an execution and track it from its first moment.
    pub async fn launch(
        &self,
        launcher: &dyn ExecutionLauncher,
        input: &StartExecutionInput,
    ) -> Result<TrackerHandle, TrackerError> {
        let run = launcher
            .start_execution(input)
            .await
            .map_err(TrackerError::Launch)?;

        let status = match status_from_run(run.status) {
            ExecutionStatus::Unknown => ExecutionStatus::Pending,
            status => status,
        };
        info!(execution_id = %run.id, actor_id = %input.actor_id, %status, "execution launched");

        let view = ExecutionView::with_status(ExecutionId::new(run.id), status);
        Ok(self.track(view).await)
    }

    /// Track an execution that is already running (or finished).
    pub async fn attach(&self, execution_id: ExecutionId) -> TrackerHandle {
        info!(execution_id = %execution_id, "attaching to execution");
        self.track(ExecutionView::new(execution_id)).await
    }

    async fn track(&self, view: ExecutionView) -> TrackerHandle {
        let execution_id = view.execution_id.clone();
        let (tx, rx) = mpsc::channel(self.config.queue_capacity);
        let cancel = CancellationToken::new();
        let stopped = Arc::new(AtomicBool::new(false));
        let publisher = ViewPublisher::new(view.clone());

        let adapter = ChannelAdapter::new(self.transport.clone(), &self.config);
        let connection = match adapter.connect(&execution_id, tx.clone(), &cancel).await {
            Ok(connection) => connection,
            Err(err) => {
                warn!(execution_id = %execution_id, error = %err, "polling until the event channel recovers");
                let _ = tx
                    .send(TrackerInput::Channel(ChannelSignal::Unavailable {
                        reason: err.to_string(),
                    }))
                    .await;
                adapter.spawn_reconnect(&execution_id, tx.clone(), &cancel)
            }
        };

        let machine = TrackerMachine::new(view, &self.config, Instant::now());
        let runtime = TrackerRuntime::new(
            machine,
            publisher.clone(),
            self.snapshots.clone(),
            rx,
            tx,
            cancel.clone(),
            stopped.clone(),
            &self.config,
        );
        let task = tokio::spawn(runtime.run());

        TrackerHandle {
            execution_id,
            publisher,
            cancel,
            stopped,
            connection: Some(connection),
            task: Some(task),
        }
    }
}

/// Handle on one tracked execution. Dropping it stops tracking.
pub struct TrackerHandle {
    execution_id: ExecutionId,
    publisher: ViewPublisher,
    cancel: CancellationToken,
    stopped: Arc<AtomicBool>,
    connection: Option<ConnectionHandle>,
    task: Option<JoinHandle<()>>,
}

impl TrackerHandle {
    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    pub fn current(&self) -> Arc<ExecutionView> {
        self.publisher.current()
    }

    pub fn subscribe(&self) -> ViewSubscription {
        self.publisher.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.publisher.unsubscribe(id)
    }

    /// Stop tracking. No view is published after this returns.
    ///
    /// Subscriptions finish, the channel subscription and timers are released,
    /// and fetches still in flight are discarded.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.publisher.close();
        info!(execution_id = %self.execution_id, "tracking stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop and wait for the background tasks to exit.
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(connection) = self.connection.take() {
            connection.join().await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for TrackerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
