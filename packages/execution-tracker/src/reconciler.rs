//! Admission and merge rules for one execution view.
//!
//! The reconciler is a pure state machine: no IO, no async, no clocks. It is
//! driven serially by the tracker runtime, which is the only caller, so the
//! monotonicity rules below hold for every view it hands out.
//!
//! # Admission
//!
//! | Event | After terminal | `sequence <= last_event_sequence` |
//! |-------|----------------|-----------------------------------|
//! | `Log` | appended, tagged late | deduplicated by sequence |
//! | `DocumentFound` | rejected | merged (idempotent) |
//! | status / counter events | rejected | discarded as stale |
//!
//! A stale `Started` still fills a missing `started_at`, and a stale
//! `Progress` still carries its `phase` when no later phase has been seen.
//! Neither touches status, counters or `last_event_sequence`.
//!
//! # Snapshot merge
//!
//! Status is adopted only when strictly further along the lifecycle, counters
//! take the component-wise maximum, documents are unioned. Nothing a snapshot
//! carries can remove a document or lower a counter.

use chrono::{DateTime, Utc};
use tracing::{debug, info, trace, warn};

use crate::error::TrackerError;
use crate::events::{EventKind, ExecutionEvent};
use crate::snapshot::ExecutionSnapshot;
use crate::types::{ConnectionState, ExecutionStatus, LogEntry, LogLevel};
use crate::view::ExecutionView;

/// Outcome of offering one input to the reconciler.
#[derive(Debug)]
pub enum Admission {
    /// The view changed; a new copy should be published.
    Applied,
    /// Accepted but nothing changed (e.g. a duplicate document).
    Unchanged,
    /// Rejected by the admission rule.
    Discarded(TrackerError),
}

impl Admission {
    pub fn is_applied(&self) -> bool {
        matches!(self, Admission::Applied)
    }
}

pub struct Reconciler {
    view: ExecutionView,
    log_retention: usize,
    /// Sequence of the event that set the current phase.
    phase_sequence: u64,
}

impl Reconciler {
    pub fn new(view: ExecutionView, log_retention: usize) -> Self {
        Self {
            view,
            log_retention,
            phase_sequence: 0,
        }
    }

    pub fn view(&self) -> &ExecutionView {
        &self.view
    }

    pub fn into_view(self) -> ExecutionView {
        self.view
    }

    /// Offer one channel event to the view.
    pub fn apply_event(&mut self, event: &ExecutionEvent) -> Admission {
        let admission = self.admit(event);
        match &admission {
            Admission::Applied => {
                self.view.revision += 1;
                trace!(
                    execution_id = %self.view.execution_id,
                    sequence = event.sequence,
                    event = event.kind.name(),
                    "event applied"
                );
            }
            Admission::Unchanged => {}
            Admission::Discarded(reason @ TrackerError::TerminalStateViolation { .. }) => {
                warn!(execution_id = %self.view.execution_id, error = %reason, "event after terminal status dropped");
            }
            Admission::Discarded(reason) => {
                debug!(execution_id = %self.view.execution_id, error = %reason, "event discarded");
            }
        }
        admission
    }

    fn admit(&mut self, event: &ExecutionEvent) -> Admission {
        let sequence = event.sequence;

        if self.view.status.is_terminal() {
            return match &event.kind {
                EventKind::Log { line, level } => {
                    self.push_log(sequence, *level, line, event.timestamp, true)
                }
                kind => Admission::Discarded(TrackerError::TerminalStateViolation {
                    event: kind.name(),
                    sequence,
                    status: self.view.status,
                }),
            };
        }

        if event.kind.is_ordering_sensitive() {
            if sequence <= self.view.last_event_sequence {
                if self.fill_from_stale(sequence, &event.kind) {
                    return Admission::Applied;
                }
                return Admission::Discarded(TrackerError::StaleEventDiscarded {
                    event: event.kind.name(),
                    sequence,
                    last_accepted: self.view.last_event_sequence,
                });
            }
            self.view.last_event_sequence = sequence;
        }

        match &event.kind {
            EventKind::Started { started_at } => {
                self.view.fill_started_at(*started_at);
                self.advance_status(ExecutionStatus::Running);
            }
            EventKind::Progress { counters, phase } => {
                self.view.progress.counters.merge_max(counters);
                if let Some(phase) = phase {
                    self.take_phase(sequence, phase);
                }
                // A Started event may never arrive when attaching mid-execution
                if self.view.status.rank() < ExecutionStatus::Running.rank() {
                    self.advance_status(ExecutionStatus::Running);
                }
            }
            EventKind::Paused => self.advance_status(ExecutionStatus::Paused),
            EventKind::Resumed => self.advance_status(ExecutionStatus::Running),
            EventKind::Completed { summary } => {
                if let Some(counters) = &summary.counters {
                    self.view.progress.counters.merge_max(counters);
                }
                if summary.message.is_some() {
                    self.view.summary = summary.message.clone();
                }
                self.advance_status(ExecutionStatus::Completed);
                self.view.set_completed_at(event.timestamp);
            }
            EventKind::Failed { reason } => {
                self.view.failure_reason = Some(reason.clone());
                self.advance_status(ExecutionStatus::Failed);
                self.view.set_completed_at(event.timestamp);
            }
            EventKind::DocumentFound { document } => {
                let mut document = document.clone();
                document.sequence = Some(sequence);
                return if self.view.upsert_document(&document) {
                    Admission::Applied
                } else {
                    Admission::Unchanged
                };
            }
            EventKind::Log { line, level } => {
                return self.push_log(sequence, *level, line, event.timestamp, false);
            }
        }

        Admission::Applied
    }

    /// Order-insensitive fields an out-of-order event can still contribute.
    fn fill_from_stale(&mut self, sequence: u64, kind: &EventKind) -> bool {
        match kind {
            EventKind::Started { started_at } => self.view.fill_started_at(*started_at),
            EventKind::Progress {
                phase: Some(phase), ..
            } => self.take_phase(sequence, phase),
            _ => false,
        }
    }

    /// The phase reported by the highest sequence wins.
    fn take_phase(&mut self, sequence: u64, phase: &str) -> bool {
        if sequence <= self.phase_sequence {
            return false;
        }
        self.phase_sequence = sequence;
        if self.view.progress.phase.as_deref() == Some(phase) {
            return false;
        }
        self.view.progress.phase = Some(phase.to_string());
        true
    }

    fn advance_status(&mut self, next: ExecutionStatus) {
        let current = self.view.status;
        if current.can_transition_to(next) {
            info!(
                execution_id = %self.view.execution_id,
                from = %current,
                to = %next,
                "execution status changed"
            );
            self.view.status = next;
        }
    }

    fn push_log(
        &mut self,
        sequence: u64,
        level: LogLevel,
        line: &str,
        timestamp: DateTime<Utc>,
        late: bool,
    ) -> Admission {
        let entry = LogEntry {
            sequence,
            level,
            line: line.to_string(),
            timestamp,
            late,
        };
        if self.view.push_log(entry, self.log_retention) {
            Admission::Applied
        } else {
            Admission::Unchanged
        }
    }

    /// Merge an authoritative snapshot into the view.
    ///
    /// Always counts as a mutation: at minimum `last_snapshot_at` moves.
    pub fn apply_snapshot(
        &mut self,
        snapshot: ExecutionSnapshot,
        fetched_at: DateTime<Utc>,
    ) -> Admission {
        let local = self.view.status;
        let remote = snapshot.status;

        if remote.rank() > local.rank() {
            info!(
                execution_id = %self.view.execution_id,
                from = %local,
                to = %remote,
                "execution status advanced by snapshot"
            );
            self.view.status = remote;
        } else if remote != local && remote != ExecutionStatus::Unknown {
            if remote.rank() == local.rank() {
                warn!(
                    execution_id = %self.view.execution_id,
                    local = %local,
                    snapshot = %remote,
                    "snapshot status disagrees with local status, keeping local"
                );
            } else {
                debug!(
                    execution_id = %self.view.execution_id,
                    local = %local,
                    snapshot = %remote,
                    "snapshot is behind local status"
                );
            }
        }

        if let Some(started_at) = snapshot.started_at {
            self.view.fill_started_at(started_at);
        }
        if self.view.status.is_terminal() && self.view.completed_at.is_none() {
            self.view
                .set_completed_at(snapshot.completed_at.unwrap_or(fetched_at));
        }
        if self.view.status == ExecutionStatus::Failed && self.view.failure_reason.is_none() {
            self.view.failure_reason = snapshot
                .failure_reason
                .or_else(|| Some("execution failed".to_string()));
        }

        self.view.progress.counters.merge_max(&snapshot.counters);
        if self.view.progress.phase.is_none() {
            self.view.progress.phase = snapshot.phase;
        }

        let known = self.view.documents.len();
        for mut document in snapshot.documents {
            document.sequence = None;
            self.view.upsert_document(&document);
        }

        self.view.last_snapshot_at = Some(fetched_at);
        self.view.revision += 1;
        debug!(
            execution_id = %self.view.execution_id,
            status = %self.view.status,
            documents_added = self.view.documents.len() - known,
            "snapshot reconciled"
        );
        Admission::Applied
    }

    /// The snapshot source proved the execution does not exist.
    pub fn mark_not_found(&mut self, reason: String, at: DateTime<Utc>) -> Admission {
        if self.view.status.is_terminal() {
            return Admission::Unchanged;
        }
        warn!(execution_id = %self.view.execution_id, %reason, "execution not found");
        self.view.status = ExecutionStatus::Failed;
        self.view.failure_reason = Some(reason);
        self.view.set_completed_at(at);
        self.view.revision += 1;
        Admission::Applied
    }

    /// No further snapshots will be merged.
    pub fn settle(&mut self) -> Admission {
        if self.view.settled {
            return Admission::Unchanged;
        }
        self.view.settled = true;
        self.view.revision += 1;
        Admission::Applied
    }

    pub fn set_connection_state(&mut self, state: ConnectionState) -> Admission {
        if self.view.connection_state == state {
            return Admission::Unchanged;
        }
        debug!(
            execution_id = %self.view.execution_id,
            from = %self.view.connection_state,
            to = %state,
            "connection state changed"
        );
        self.view.connection_state = state;
        self.view.revision += 1;
        Admission::Applied
    }
}
