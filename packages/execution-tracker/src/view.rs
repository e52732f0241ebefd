//! The UI-facing state of one tracked execution.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;

use crate::types::{
    ConnectionState, DocumentId, DocumentRecord, ExecutionId, ExecutionStatus, LogEntry, Progress,
};

/// Single source of truth for one tracked execution.
///
/// Only the reconciler mutates a view; consumers receive immutable copies
/// through the [`ViewPublisher`](crate::publisher::ViewPublisher).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionView {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: Progress,
    /// Insertion-ordered, keyed by document id.
    pub documents: IndexMap<DocumentId, DocumentRecord>,
    pub log_lines: VecDeque<LogEntry>,
    /// Highest sequence accepted for status and counter events.
    pub last_event_sequence: u64,
    pub connection_state: ConnectionState,
    pub failure_reason: Option<String>,
    pub summary: Option<String>,
    pub last_snapshot_at: Option<DateTime<Utc>>,
    /// Polling has stopped; only late log lines can still change the view.
    pub settled: bool,
    /// Number of accepted mutations so far.
    pub revision: u64,
}

impl ExecutionView {
    pub fn new(execution_id: ExecutionId) -> Self {
        Self::with_status(execution_id, ExecutionStatus::Unknown)
    }

    pub fn with_status(execution_id: ExecutionId, status: ExecutionStatus) -> Self {
        Self {
            execution_id,
            status,
            started_at: None,
            completed_at: None,
            progress: Progress::default(),
            documents: IndexMap::new(),
            log_lines: VecDeque::new(),
            last_event_sequence: 0,
            connection_state: ConnectionState::Disconnected,
            failure_reason: None,
            summary: None,
            last_snapshot_at: None,
            settled: false,
            revision: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn document(&self, id: &str) -> Option<&DocumentRecord> {
        self.documents.get(&DocumentId::new(id))
    }

    /// Document ids in display order.
    pub fn document_ids(&self) -> Vec<&str> {
        self.documents.keys().map(DocumentId::as_str).collect()
    }

    /// Insert a new document at the end or merge into the existing entry in place.
    pub(crate) fn upsert_document(&mut self, document: &DocumentRecord) -> bool {
        match self.documents.get_mut(&document.id) {
            Some(existing) => existing.merge_from(document),
            None => {
                self.documents.insert(document.id.clone(), document.clone());
                true
            }
        }
    }

    /// Insert a log line in sequence order, keeping the `retention` highest sequences.
    ///
    /// Returns false for a sequence already retained, or one older than every
    /// retained line once the buffer is full (it was evicted or would be).
    pub(crate) fn push_log(&mut self, entry: LogEntry, retention: usize) -> bool {
        if retention == 0 {
            return false;
        }
        let index = match self
            .log_lines
            .binary_search_by_key(&entry.sequence, |l| l.sequence)
        {
            Ok(_) => return false,
            Err(index) => index,
        };
        if index == 0 && self.log_lines.len() >= retention {
            return false;
        }
        self.log_lines.insert(index, entry);
        while self.log_lines.len() > retention {
            self.log_lines.pop_front();
        }
        true
    }

    /// Fill `started_at` if absent, pulling `completed_at` up so it never precedes it.
    pub(crate) fn fill_started_at(&mut self, at: DateTime<Utc>) -> bool {
        if self.started_at.is_some() {
            return false;
        }
        self.started_at = Some(at);
        if let Some(completed) = self.completed_at {
            if completed < at {
                self.completed_at = Some(at);
            }
        }
        true
    }

    /// Set `completed_at`, never earlier than `started_at`.
    pub(crate) fn set_completed_at(&mut self, at: DateTime<Utc>) {
        let at = match self.started_at {
            Some(started) if at < started => started,
            _ => at,
        };
        self.completed_at = Some(at);
    }
}
