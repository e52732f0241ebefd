use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Counters, DocumentRecord, LogLevel};

/// One message from the push channel.
///
/// Wire form is a flat JSON object tagged by `type`:
///
/// ```json
/// {"sequence": 3, "timestamp": "2024-05-01T10:00:03Z", "type": "progress",
///  "counters": {"items_processed": 5}, "phase": "crawling"}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    /// Producer-assigned ordering marker, strictly increasing per execution.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl ExecutionEvent {
    pub fn new(sequence: u64, kind: EventKind) -> Self {
        Self {
            sequence,
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Final summary carried by a `Completed` event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counters: Option<Counters>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Started {
        started_at: DateTime<Utc>,
    },
    Progress {
        counters: Counters,
        #[serde(default)]
        phase: Option<String>,
    },
    DocumentFound {
        document: DocumentRecord,
    },
    /// The envelope timestamp is the time the line was logged.
    Log {
        line: String,
        level: LogLevel,
    },
    Paused,
    Resumed,
    Completed {
        #[serde(default)]
        summary: CompletionSummary,
    },
    Failed {
        reason: String,
    },
}

impl EventKind {
    /// Events that touch status or counters and therefore must arrive in sequence order.
    pub fn is_ordering_sensitive(&self) -> bool {
        match self {
            EventKind::Started { .. }
            | EventKind::Progress { .. }
            | EventKind::Paused
            | EventKind::Resumed
            | EventKind::Completed { .. }
            | EventKind::Failed { .. } => true,
            EventKind::DocumentFound { .. } | EventKind::Log { .. } => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Started { .. } => "started",
            EventKind::Progress { .. } => "progress",
            EventKind::DocumentFound { .. } => "document_found",
            EventKind::Log { .. } => "log",
            EventKind::Paused => "paused",
            EventKind::Resumed => "resumed",
            EventKind::Completed { .. } => "completed",
            EventKind::Failed { .. } => "failed",
        }
    }
}
