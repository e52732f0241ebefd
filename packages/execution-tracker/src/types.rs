//! Value types shared by events, snapshots and the execution view.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identifier of a remote execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(String);

impl ExecutionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExecutionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Identifier of a discovered document, unique within one execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Execution lifecycle status.
///
/// ```text
/// Unknown ─┐
///          ├─► Running ◄─► Paused
/// Pending ─┘      │          │
///                 ▼          ▼
///           Completed | Failed   (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Unknown,
}

impl ExecutionStatus {
    /// Position along the lifecycle. `Running` and `Paused` share a rank.
    pub fn rank(self) -> u8 {
        match self {
            ExecutionStatus::Unknown => 0,
            ExecutionStatus::Pending => 1,
            ExecutionStatus::Running | ExecutionStatus::Paused => 2,
            ExecutionStatus::Completed | ExecutionStatus::Failed => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }

    /// Whether a live event may move the status from `self` to `next`.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match (self, next) {
            (Completed | Failed, _) => false,
            (_, Unknown) => false,
            (Running, Paused) | (Paused, Running) => true,
            (current, next) => next.rank() > current.rank(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health of the push channel, tracked separately from execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    Reconnecting,
    Disconnected,
    PollingFallback,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::PollingFallback => "polling_fallback",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monotonic progress counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Counters {
    pub items_processed: u64,
    pub items_failed: u64,
    pub requests_made: u64,
    pub items_total: Option<u64>,
}

impl Counters {
    pub fn processed(items_processed: u64) -> Self {
        Self {
            items_processed,
            ..Default::default()
        }
    }

    /// Raise every counter to at least the value in `other`. Returns true if anything moved.
    pub fn merge_max(&mut self, other: &Counters) -> bool {
        let before = *self;
        self.items_processed = self.items_processed.max(other.items_processed);
        self.items_failed = self.items_failed.max(other.items_failed);
        self.requests_made = self.requests_made.max(other.requests_made);
        self.items_total = match (self.items_total, other.items_total) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        *self != before
    }

    /// True when no counter in `self` is below its value in `earlier`.
    pub fn dominates(&self, earlier: &Counters) -> bool {
        self.items_processed >= earlier.items_processed
            && self.items_failed >= earlier.items_failed
            && self.requests_made >= earlier.requests_made
            && match (self.items_total, earlier.items_total) {
                (Some(a), Some(b)) => a >= b,
                (None, Some(_)) => false,
                _ => true,
            }
    }
}

/// Counters plus the current phase label.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub counters: Counters,
    pub phase: Option<String>,
}

/// A discovered document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: DocumentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Sequence of the event that last enriched this record. `None` for snapshot data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

impl DocumentRecord {
    pub fn new(id: impl Into<DocumentId>) -> Self {
        Self {
            id: id.into(),
            url: None,
            title: None,
            content_type: None,
            discovered_at: None,
            metadata: serde_json::Map::new(),
            sequence: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Merge another record for the same id into this one.
    ///
    /// A newer record (higher sequence) overwrites the fields it carries. An
    /// older or unsequenced record only fills fields and metadata keys that are
    /// still missing. Returns true if this record changed.
    pub fn merge_from(&mut self, incoming: &DocumentRecord) -> bool {
        let newer = match (incoming.sequence, self.sequence) {
            (Some(theirs), Some(ours)) => theirs > ours,
            (Some(_), None) => true,
            (None, _) => false,
        };

        let mut changed = false;
        changed |= merge_field(&mut self.url, &incoming.url, newer);
        changed |= merge_field(&mut self.title, &incoming.title, newer);
        changed |= merge_field(&mut self.content_type, &incoming.content_type, newer);
        changed |= merge_field(&mut self.discovered_at, &incoming.discovered_at, newer);

        for (key, value) in &incoming.metadata {
            match self.metadata.get(key) {
                Some(existing) if !newer || existing == value => {}
                _ => {
                    self.metadata.insert(key.clone(), value.clone());
                    changed = true;
                }
            }
        }

        if newer {
            self.sequence = incoming.sequence;
        }
        changed
    }
}

fn merge_field<T: Clone + PartialEq>(ours: &mut Option<T>, theirs: &Option<T>, newer: bool) -> bool {
    match (ours.as_ref(), theirs) {
        (_, None) => false,
        (None, Some(value)) => {
            *ours = Some(value.clone());
            true
        }
        (Some(current), Some(value)) if newer && current != value => {
            *ours = Some(value.clone());
            true
        }
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// One retained log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub sequence: u64,
    pub level: LogLevel,
    pub line: String,
    pub timestamp: DateTime<Utc>,
    /// Received after the execution reached a terminal status.
    #[serde(default)]
    pub late: bool,
}
