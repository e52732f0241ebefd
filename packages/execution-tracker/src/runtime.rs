//! Single-writer loop that owns an execution view.
//!
//! Every producer (adapter pump, snapshot fetches, retry timers) sends
//! `TrackerInput`s into one queue. The loop applies them strictly in dequeue
//! order and publishes inside the same iteration, so observers see mutations
//! in application order.
//!
//! The split mirrors a decide/execute machine:
//!
//! - [`TrackerMachine::decide`] is synchronous: it mutates the view through
//!   the [`Reconciler`] and returns at most one command.
//! - [`TrackerRuntime`] executes commands (spawned fetches and timers) that
//!   report back through the queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::channel::ChannelSignal;
use crate::config::TrackerConfig;
use crate::error::TrackerError;
use crate::events::ExecutionEvent;
use crate::publisher::ViewPublisher;
use crate::reconciler::Reconciler;
use crate::snapshot::{ExecutionSnapshot, SnapshotError, SnapshotSource};
use crate::types::{ConnectionState, ExecutionId};
use crate::view::ExecutionView;

/// Everything the loop reacts to.
#[derive(Debug)]
pub enum TrackerInput {
    Event(ExecutionEvent),
    Channel(ChannelSignal),
    SnapshotLoaded {
        snapshot: ExecutionSnapshot,
        fetched_at: DateTime<Utc>,
    },
    SnapshotFailed(SnapshotError),
    /// Backoff timer after a failed fetch elapsed.
    RetryDue,
    /// Periodic reconciliation.
    PollTick,
    /// Periodic check of how long the channel has been down.
    HealthCheck,
}

impl TrackerInput {
    pub fn name(&self) -> &'static str {
        match self {
            TrackerInput::Event(_) => "event",
            TrackerInput::Channel(_) => "channel",
            TrackerInput::SnapshotLoaded { .. } => "snapshot_loaded",
            TrackerInput::SnapshotFailed(_) => "snapshot_failed",
            TrackerInput::RetryDue => "retry_due",
            TrackerInput::PollTick => "poll_tick",
            TrackerInput::HealthCheck => "health_check",
        }
    }
}

/// IO requested by the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerCommand {
    FetchSnapshot,
    RetrySnapshotAfter(Duration),
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Decision {
    /// The view changed and must be published.
    pub mutated: bool,
    pub command: Option<TrackerCommand>,
}

/// Pure state machine behind the runtime loop.
pub struct TrackerMachine {
    reconciler: Reconciler,
    retry_backoff: Backoff,
    fallback_after: Duration,
    fetch_in_flight: bool,
    /// Another fetch was requested while one was in flight.
    refetch: bool,
    retry_scheduled: bool,
    fetch_failures: u32,
    non_connected_since: Option<Instant>,
    polling_stopped: bool,
}

impl TrackerMachine {
    pub fn new(view: ExecutionView, config: &TrackerConfig, now: Instant) -> Self {
        Self {
            reconciler: Reconciler::new(view, config.log_retention_count),
            retry_backoff: config.reconnect_backoff(),
            fallback_after: config.fallback_after(),
            fetch_in_flight: false,
            refetch: false,
            retry_scheduled: false,
            fetch_failures: 0,
            non_connected_since: Some(now),
            polling_stopped: false,
        }
    }

    pub fn view(&self) -> &ExecutionView {
        self.reconciler.view()
    }

    pub fn is_polling_stopped(&self) -> bool {
        self.polling_stopped
    }

    /// Initial hydration.
    pub fn start(&mut self) -> Option<TrackerCommand> {
        self.request_snapshot()
    }

    pub fn decide(&mut self, input: TrackerInput, now: Instant) -> Decision {
        match input {
            TrackerInput::Event(event) => self.on_event(event),
            TrackerInput::Channel(signal) => self.on_signal(signal, now),
            TrackerInput::SnapshotLoaded {
                snapshot,
                fetched_at,
            } => self.on_snapshot(snapshot, fetched_at),
            TrackerInput::SnapshotFailed(error) => self.on_snapshot_failed(error),
            TrackerInput::RetryDue => {
                self.retry_scheduled = false;
                Decision {
                    mutated: false,
                    command: self.request_snapshot(),
                }
            }
            TrackerInput::PollTick => {
                let command = if self.view().is_terminal() || self.retry_scheduled {
                    None
                } else {
                    self.request_snapshot()
                };
                Decision {
                    mutated: false,
                    command,
                }
            }
            TrackerInput::HealthCheck => self.on_health_check(now),
        }
    }

    fn on_event(&mut self, event: ExecutionEvent) -> Decision {
        let was_terminal = self.view().is_terminal();
        let mutated = self.reconciler.apply_event(&event).is_applied();

        // One settling snapshot picks up documents the channel may have missed
        let command = if !was_terminal && self.view().is_terminal() {
            self.request_snapshot()
        } else {
            None
        };

        Decision { mutated, command }
    }

    fn on_signal(&mut self, signal: ChannelSignal, now: Instant) -> Decision {
        let current = self.view().connection_state;
        let mut command = None;

        let next = match signal {
            ChannelSignal::Connected => {
                self.non_connected_since = None;
                ConnectionState::Connected
            }
            ChannelSignal::Reconnected => {
                self.non_connected_since = None;
                // Events may have been missed while the channel was down
                command = self.request_snapshot();
                ConnectionState::Connected
            }
            ChannelSignal::Dropped { reason } => {
                let err = TrackerError::ChannelDropped(reason);
                info!(execution_id = %self.view().execution_id, error = %err, "waiting for channel to recover");
                self.non_connected_since.get_or_insert(now);
                self.non_connected(current)
            }
            ChannelSignal::Reconnecting { attempt } => {
                debug!(execution_id = %self.view().execution_id, attempt, "channel reconnecting");
                self.non_connected_since.get_or_insert(now);
                self.non_connected(current)
            }
            ChannelSignal::Disconnected | ChannelSignal::Unavailable { .. } => {
                self.non_connected_since.get_or_insert(now);
                if self.polling_stopped {
                    ConnectionState::Disconnected
                } else {
                    if current != ConnectionState::PollingFallback {
                        command = self.request_snapshot();
                    }
                    ConnectionState::PollingFallback
                }
            }
        };

        Decision {
            mutated: self.reconciler.set_connection_state(next).is_applied(),
            command,
        }
    }

    /// Reconnect attempts do not pull the view out of polling mode.
    fn non_connected(&self, current: ConnectionState) -> ConnectionState {
        match current {
            ConnectionState::PollingFallback => ConnectionState::PollingFallback,
            _ => ConnectionState::Reconnecting,
        }
    }

    fn on_snapshot(&mut self, snapshot: ExecutionSnapshot, fetched_at: DateTime<Utc>) -> Decision {
        self.fetch_in_flight = false;
        self.fetch_failures = 0;

        if self.polling_stopped {
            return Decision::default();
        }

        let mut mutated = self.reconciler.apply_snapshot(snapshot, fetched_at).is_applied();

        let command = if self.refetch {
            self.refetch = false;
            self.request_snapshot()
        } else {
            if self.view().is_terminal() {
                info!(
                    execution_id = %self.view().execution_id,
                    status = %self.view().status,
                    "final snapshot reconciled, polling stopped"
                );
                self.polling_stopped = true;
                mutated |= self.reconciler.settle().is_applied();
            }
            None
        };

        Decision { mutated, command }
    }

    fn on_snapshot_failed(&mut self, error: SnapshotError) -> Decision {
        self.fetch_in_flight = false;
        self.refetch = false;

        match error {
            SnapshotError::NotFound(_) => {
                let reason = error.to_string();
                self.polling_stopped = true;
                let not_found = self
                    .reconciler
                    .mark_not_found(reason, Utc::now())
                    .is_applied();
                let mutated = self.reconciler.settle().is_applied() || not_found;
                Decision {
                    mutated,
                    command: None,
                }
            }
            SnapshotError::Failed(reason) => {
                self.fetch_failures += 1;
                let err = TrackerError::SnapshotFetchFailed(reason);
                warn!(
                    execution_id = %self.view().execution_id,
                    failures = self.fetch_failures,
                    error = %err,
                    "snapshot fetch failed"
                );

                if self.polling_stopped || self.retry_scheduled {
                    return Decision::default();
                }
                self.retry_scheduled = true;
                Decision {
                    mutated: false,
                    command: Some(TrackerCommand::RetrySnapshotAfter(
                        self.retry_backoff.delay(self.fetch_failures),
                    )),
                }
            }
        }
    }

    fn on_health_check(&mut self, now: Instant) -> Decision {
        let state = self.view().connection_state;
        let overdue = matches!(
            state,
            ConnectionState::Reconnecting | ConnectionState::Disconnected
        ) && self
            .non_connected_since
            .is_some_and(|since| now.duration_since(since) >= self.fallback_after);

        if !overdue || self.polling_stopped {
            return Decision::default();
        }

        info!(
            execution_id = %self.view().execution_id,
            after_ms = self.fallback_after.as_millis() as u64,
            "channel down too long, falling back to polling"
        );
        let mutated = self
            .reconciler
            .set_connection_state(ConnectionState::PollingFallback)
            .is_applied();
        Decision {
            mutated,
            command: self.request_snapshot(),
        }
    }

    fn request_snapshot(&mut self) -> Option<TrackerCommand> {
        if self.polling_stopped {
            return None;
        }
        if self.fetch_in_flight {
            self.refetch = true;
            return None;
        }
        self.fetch_in_flight = true;
        Some(TrackerCommand::FetchSnapshot)
    }
}

/// Async half: owns the queue, timers and spawned IO.
pub struct TrackerRuntime {
    machine: TrackerMachine,
    publisher: ViewPublisher,
    snapshots: Arc<dyn SnapshotSource>,
    inbox: mpsc::Receiver<TrackerInput>,
    outbox: mpsc::Sender<TrackerInput>,
    cancel: CancellationToken,
    stopped: Arc<AtomicBool>,
    snapshot_interval: Duration,
    health_interval: Duration,
}

impl TrackerRuntime {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        machine: TrackerMachine,
        publisher: ViewPublisher,
        snapshots: Arc<dyn SnapshotSource>,
        inbox: mpsc::Receiver<TrackerInput>,
        outbox: mpsc::Sender<TrackerInput>,
        cancel: CancellationToken,
        stopped: Arc<AtomicBool>,
        config: &TrackerConfig,
    ) -> Self {
        Self {
            machine,
            publisher,
            snapshots,
            inbox,
            outbox,
            cancel,
            stopped,
            snapshot_interval: config.snapshot_interval(),
            health_interval: (config.fallback_after() / 4).max(Duration::from_millis(10)),
        }
    }

    fn execution_id(&self) -> &ExecutionId {
        &self.machine.view().execution_id
    }

    pub async fn run(mut self) {
        debug!(execution_id = %self.execution_id(), "tracker runtime started");

        let mut poll = tokio::time::interval(self.snapshot_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        poll.tick().await; // Skip first immediate tick

        let mut health = tokio::time::interval(self.health_interval);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        health.tick().await;

        if let Some(command) = self.machine.start() {
            self.execute(command);
        }

        loop {
            let input = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                input = self.inbox.recv() => match input {
                    Some(input) => input,
                    None => break,
                },
                _ = poll.tick() => TrackerInput::PollTick,
                _ = health.tick() => TrackerInput::HealthCheck,
            };

            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            self.step(input);
        }

        debug!(execution_id = %self.execution_id(), "tracker runtime stopped");
    }

    fn step(&mut self, input: TrackerInput) {
        let name = input.name();
        let decision = self.machine.decide(input, Instant::now());

        if decision.mutated {
            self.publisher.publish(self.machine.view().clone());
        }
        if let Some(command) = decision.command {
            debug!(execution_id = %self.execution_id(), input = name, command = ?command, "executing command");
            self.execute(command);
        }
    }

    fn execute(&self, command: TrackerCommand) {
        let outbox = self.outbox.clone();
        let cancel = self.cancel.clone();

        match command {
            TrackerCommand::FetchSnapshot => {
                let snapshots = self.snapshots.clone();
                let execution_id = self.execution_id().clone();
                tokio::spawn(async move {
                    let input = tokio::select! {
                        _ = cancel.cancelled() => return,
                        result = snapshots.fetch_snapshot(&execution_id) => match result {
                            Ok(snapshot) => TrackerInput::SnapshotLoaded {
                                snapshot,
                                fetched_at: Utc::now(),
                            },
                            Err(e) => TrackerInput::SnapshotFailed(e),
                        },
                    };
                    // Queue is closed once the tracker stopped
                    let _ = outbox.send(input).await;
                });
            }
            TrackerCommand::RetrySnapshotAfter(delay) => {
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {
                            let _ = outbox.send(TrackerInput::RetryDue).await;
                        }
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CompletionSummary, EventKind};
    use crate::types::{Counters, DocumentRecord, ExecutionStatus};

    fn machine() -> (TrackerMachine, Instant) {
        let now = Instant::now();
        let config = TrackerConfig::default()
            .with_reconnect(3, 100, 1_000)
            .with_fallback_after_ms(1_000);
        let view = ExecutionView::new(ExecutionId::new("exec-1"));
        (TrackerMachine::new(view, &config, now), now)
    }

    fn event(seq: u64, kind: EventKind) -> TrackerInput {
        TrackerInput::Event(ExecutionEvent::new(seq, kind))
    }

    fn progress(seq: u64, count: u64) -> TrackerInput {
        event(
            seq,
            EventKind::Progress {
                counters: Counters::processed(count),
                phase: None,
            },
        )
    }

    fn loaded(snapshot: ExecutionSnapshot) -> TrackerInput {
        TrackerInput::SnapshotLoaded {
            snapshot,
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn start_requests_hydration_once() {
        let (mut m, now) = machine();
        assert_eq!(m.start(), Some(TrackerCommand::FetchSnapshot));
        // In flight: a poll tick is coalesced into one follow-up fetch
        assert_eq!(m.decide(TrackerInput::PollTick, now).command, None);

        let decision = m.decide(loaded(ExecutionSnapshot::new(ExecutionStatus::Running)), now);
        assert!(decision.mutated);
        assert_eq!(decision.command, Some(TrackerCommand::FetchSnapshot));
    }

    #[test]
    fn reconnect_snapshot_raises_counters() {
        let (mut m, now) = machine();
        m.decide(TrackerInput::Channel(ChannelSignal::Connected), now);
        m.decide(progress(5, 10), now);
        m.decide(
            TrackerInput::Channel(ChannelSignal::Dropped {
                reason: "eof".into(),
            }),
            now,
        );
        assert_eq!(m.view().connection_state, ConnectionState::Reconnecting);

        let decision = m.decide(TrackerInput::Channel(ChannelSignal::Reconnected), now);
        assert_eq!(decision.command, Some(TrackerCommand::FetchSnapshot));
        assert_eq!(m.view().connection_state, ConnectionState::Connected);

        m.decide(
            loaded(
                ExecutionSnapshot::new(ExecutionStatus::Running)
                    .with_counters(Counters::processed(12)),
            ),
            now,
        );
        assert_eq!(m.view().progress.counters.items_processed, 12);
    }

    #[test]
    fn disconnected_enters_polling_fallback() {
        let (mut m, now) = machine();
        let decision = m.decide(TrackerInput::Channel(ChannelSignal::Disconnected), now);
        assert!(decision.mutated);
        assert_eq!(decision.command, Some(TrackerCommand::FetchSnapshot));
        assert_eq!(m.view().connection_state, ConnectionState::PollingFallback);

        // Background reconnect attempts keep polling mode visible
        m.decide(
            TrackerInput::Channel(ChannelSignal::Reconnecting { attempt: 1 }),
            now,
        );
        assert_eq!(m.view().connection_state, ConnectionState::PollingFallback);
    }

    #[test]
    fn health_check_falls_back_after_threshold() {
        let (mut m, now) = machine();
        m.decide(TrackerInput::Channel(ChannelSignal::Connected), now);
        m.decide(
            TrackerInput::Channel(ChannelSignal::Dropped {
                reason: "eof".into(),
            }),
            now,
        );

        let early = m.decide(TrackerInput::HealthCheck, now + Duration::from_millis(500));
        assert_eq!(early, Decision::default());

        let late = m.decide(TrackerInput::HealthCheck, now + Duration::from_millis(1_000));
        assert!(late.mutated);
        assert_eq!(late.command, Some(TrackerCommand::FetchSnapshot));
        assert_eq!(m.view().connection_state, ConnectionState::PollingFallback);
    }

    #[test]
    fn failed_fetch_retries_with_backoff_and_leaves_view() {
        let (mut m, now) = machine();
        m.start();
        let revision = m.view().revision;

        let first = m.decide(TrackerInput::SnapshotFailed(SnapshotError::Failed("503".into())), now);
        assert!(!first.mutated);
        assert_eq!(
            first.command,
            Some(TrackerCommand::RetrySnapshotAfter(Duration::from_millis(100)))
        );

        // Poll ticks wait for the scheduled retry
        assert_eq!(m.decide(TrackerInput::PollTick, now).command, None);

        assert_eq!(
            m.decide(TrackerInput::RetryDue, now).command,
            Some(TrackerCommand::FetchSnapshot)
        );
        let second = m.decide(TrackerInput::SnapshotFailed(SnapshotError::Failed("503".into())), now);
        assert_eq!(
            second.command,
            Some(TrackerCommand::RetrySnapshotAfter(Duration::from_millis(200)))
        );
        assert_eq!(m.view().revision, revision);
    }

    #[test]
    fn not_found_fails_and_stops_polling() {
        let (mut m, now) = machine();
        m.start();
        let id = ExecutionId::new("exec-1");

        let decision = m.decide(TrackerInput::SnapshotFailed(SnapshotError::NotFound(id)), now);
        assert!(decision.mutated);
        assert_eq!(m.view().status, ExecutionStatus::Failed);
        assert_eq!(
            m.view().failure_reason.as_deref(),
            Some("execution exec-1 not found")
        );
        assert!(m.is_polling_stopped());
        assert!(m.view().settled);
        assert_eq!(m.decide(TrackerInput::PollTick, now).command, None);
    }

    #[test]
    fn terminal_event_triggers_one_settling_snapshot() {
        let (mut m, now) = machine();
        m.decide(progress(1, 3), now);

        let decision = m.decide(
            event(
                2,
                EventKind::Completed {
                    summary: CompletionSummary::default(),
                },
            ),
            now,
        );
        assert!(decision.mutated);
        assert_eq!(decision.command, Some(TrackerCommand::FetchSnapshot));
        assert!(!m.view().settled);

        // A stale snapshot may still add a missed document, never un-complete
        let settle = m.decide(
            loaded(
                ExecutionSnapshot::new(ExecutionStatus::Running)
                    .with_document(DocumentRecord::new("missed")),
            ),
            now,
        );
        assert!(settle.mutated);
        assert_eq!(settle.command, None);
        assert_eq!(m.view().status, ExecutionStatus::Completed);
        assert!(m.view().document("missed").is_some());
        assert!(m.is_polling_stopped());
        assert!(m.view().settled);
    }

    #[test]
    fn discarded_event_is_not_a_mutation() {
        let (mut m, now) = machine();
        m.decide(progress(3, 5), now);
        let decision = m.decide(progress(2, 2), now);
        assert_eq!(decision, Decision::default());
        assert_eq!(m.view().progress.counters.items_processed, 5);
    }
}
