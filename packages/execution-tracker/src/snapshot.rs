//! Authoritative point-in-time state of an execution, fetched on demand.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scrape_api_client::{ApiError, ExecutionRun, RunDocument, RunStatus, ScrapeApiClient};
use thiserror::Error;

use crate::types::{Counters, DocumentRecord, ExecutionId, ExecutionStatus};

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionSnapshot {
    pub status: ExecutionStatus,
    pub counters: Counters,
    pub phase: Option<String>,
    /// Documents in canonical server order.
    pub documents: Vec<DocumentRecord>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl ExecutionSnapshot {
    pub fn new(status: ExecutionStatus) -> Self {
        Self {
            status,
            counters: Counters::default(),
            phase: None,
            documents: Vec::new(),
            started_at: None,
            completed_at: None,
            failure_reason: None,
        }
    }

    pub fn with_counters(mut self, counters: Counters) -> Self {
        self.counters = counters;
        self
    }

    pub fn with_document(mut self, document: DocumentRecord) -> Self {
        self.documents.push(document);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SnapshotError {
    #[error("execution {0} not found")]
    NotFound(ExecutionId),

    #[error("{0}")]
    Failed(String),
}

/// Request/response source of execution snapshots.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_snapshot(&self, execution_id: &ExecutionId)
        -> Result<ExecutionSnapshot, SnapshotError>;
}

#[async_trait]
impl SnapshotSource for ScrapeApiClient {
    async fn fetch_snapshot(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<ExecutionSnapshot, SnapshotError> {
        match self.get_execution(execution_id.as_str()).await {
            Ok(run) => Ok(ExecutionSnapshot::from(run)),
            Err(ApiError::NotFound(_)) => Err(SnapshotError::NotFound(execution_id.clone())),
            Err(e) => Err(SnapshotError::Failed(e.to_string())),
        }
    }
}

pub fn status_from_run(status: RunStatus) -> ExecutionStatus {
    match status {
        RunStatus::Ready => ExecutionStatus::Pending,
        RunStatus::Running | RunStatus::Aborting | RunStatus::TimingOut => ExecutionStatus::Running,
        RunStatus::Paused => ExecutionStatus::Paused,
        RunStatus::Succeeded => ExecutionStatus::Completed,
        RunStatus::Failed | RunStatus::Aborted | RunStatus::TimedOut => ExecutionStatus::Failed,
        RunStatus::Unknown => ExecutionStatus::Unknown,
    }
}

impl From<ExecutionRun> for ExecutionSnapshot {
    fn from(run: ExecutionRun) -> Self {
        let status = status_from_run(run.status);
        let failure_reason = match status {
            ExecutionStatus::Failed => Some(
                run.status_message
                    .unwrap_or_else(|| format!("execution ended with status {}", run.status)),
            ),
            _ => None,
        };

        Self {
            status,
            counters: Counters {
                items_processed: run.stats.items_processed,
                items_failed: run.stats.items_failed,
                requests_made: run.stats.requests_made,
                items_total: run.stats.items_total,
            },
            phase: run.phase,
            documents: run.documents.into_iter().map(DocumentRecord::from).collect(),
            started_at: run.started_at,
            completed_at: run.finished_at,
            failure_reason,
        }
    }
}

impl From<RunDocument> for DocumentRecord {
    fn from(doc: RunDocument) -> Self {
        Self {
            id: doc.id.as_str().into(),
            url: doc.url,
            title: doc.title,
            content_type: doc.content_type,
            discovered_at: doc.discovered_at,
            metadata: doc.metadata,
            sequence: None,
        }
    }
}

/// Scripted snapshot source for tests.
///
/// Responses are returned in the order they were pushed. Once the script is
/// exhausted the fallback snapshot (if any) is repeated, otherwise fetches fail.
#[derive(Default)]
pub struct TestSnapshotSource {
    script: Mutex<VecDeque<Result<ExecutionSnapshot, SnapshotError>>>,
    fallback: Mutex<Option<ExecutionSnapshot>>,
    calls: AtomicUsize,
}

impl TestSnapshotSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_snapshot(&self, snapshot: ExecutionSnapshot) {
        self.push(Ok(snapshot));
    }

    pub fn push_failure(&self, message: impl Into<String>) {
        self.push(Err(SnapshotError::Failed(message.into())));
    }

    pub fn push_not_found(&self, execution_id: &ExecutionId) {
        self.push(Err(SnapshotError::NotFound(execution_id.clone())));
    }

    /// Snapshot to return whenever the script is empty.
    pub fn set_fallback(&self, snapshot: ExecutionSnapshot) {
        *self.fallback.lock().unwrap_or_else(|e| e.into_inner()) = Some(snapshot);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn push(&self, response: Result<ExecutionSnapshot, SnapshotError>) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(response);
    }
}

#[async_trait]
impl SnapshotSource for TestSnapshotSource {
    async fn fetch_snapshot(
        &self,
        _execution_id: &ExecutionId,
    ) -> Result<ExecutionSnapshot, SnapshotError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(response) = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
        {
            return response;
        }
        self.fallback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| SnapshotError::Failed("no scripted snapshot".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scrape_api_client::RunStats;

    fn run(status: RunStatus) -> ExecutionRun {
        ExecutionRun {
            id: "exec-1".into(),
            status,
            status_message: None,
            started_at: None,
            finished_at: None,
            stats: RunStats {
                items_processed: 7,
                items_failed: 1,
                requests_made: 20,
                items_total: Some(50),
            },
            phase: Some("crawling".into()),
            documents: vec![RunDocument {
                id: "doc-1".into(),
                url: Some("https://example.org/1".into()),
                title: None,
                content_type: None,
                discovered_at: None,
                metadata: serde_json::Map::new(),
            }],
        }
    }

    #[test]
    fn converts_run_into_snapshot() {
        let snapshot = ExecutionSnapshot::from(run(RunStatus::Running));
        assert_eq!(snapshot.status, ExecutionStatus::Running);
        assert_eq!(snapshot.counters.items_processed, 7);
        assert_eq!(snapshot.counters.items_total, Some(50));
        assert_eq!(snapshot.documents[0].id.as_str(), "doc-1");
        assert_eq!(snapshot.documents[0].sequence, None);
        assert!(snapshot.failure_reason.is_none());
    }

    #[test]
    fn failed_run_carries_reason() {
        let snapshot = ExecutionSnapshot::from(run(RunStatus::TimedOut));
        assert_eq!(snapshot.status, ExecutionStatus::Failed);
        assert_eq!(
            snapshot.failure_reason.as_deref(),
            Some("execution ended with status TIMED-OUT")
        );
    }

    #[test]
    fn transitional_platform_states_stay_running() {
        assert_eq!(status_from_run(RunStatus::Aborting), ExecutionStatus::Running);
        assert_eq!(status_from_run(RunStatus::Ready), ExecutionStatus::Pending);
        assert_eq!(status_from_run(RunStatus::Unknown), ExecutionStatus::Unknown);
    }

    #[tokio::test]
    async fn test_source_replays_script_then_fallback() {
        let source = TestSnapshotSource::new();
        let id = ExecutionId::new("exec-1");
        source.push_failure("boom");
        source.set_fallback(ExecutionSnapshot::new(ExecutionStatus::Running));

        assert!(matches!(
            source.fetch_snapshot(&id).await,
            Err(SnapshotError::Failed(_))
        ));
        assert_eq!(
            source.fetch_snapshot(&id).await.unwrap().status,
            ExecutionStatus::Running
        );
        assert_eq!(source.call_count(), 2);
    }
}
