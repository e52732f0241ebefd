//! Event and snapshot builders.

use chrono::{DateTime, TimeZone, Utc};
use execution_tracker::{
    CompletionSummary, Counters, DocumentRecord, EventKind, ExecutionEvent, ExecutionSnapshot,
    ExecutionStatus, LogLevel,
};

pub const EXECUTION_ID: &str = "exec-42";

/// Fixed base time so timestamps are comparable across a test.
pub fn at(seconds: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap() + chrono::Duration::seconds(seconds)
}

pub fn started(seq: u64) -> ExecutionEvent {
    ExecutionEvent::new(seq, EventKind::Started { started_at: at(0) }).at(at(seq as i64))
}

pub fn progress(seq: u64, items_processed: u64) -> ExecutionEvent {
    ExecutionEvent::new(
        seq,
        EventKind::Progress {
            counters: Counters::processed(items_processed),
            phase: Some("crawling".into()),
        },
    )
    .at(at(seq as i64))
}

pub fn document(seq: u64, document: DocumentRecord) -> ExecutionEvent {
    ExecutionEvent::new(seq, EventKind::DocumentFound { document }).at(at(seq as i64))
}

pub fn log(seq: u64, line: &str) -> ExecutionEvent {
    ExecutionEvent::new(
        seq,
        EventKind::Log {
            line: line.into(),
            level: LogLevel::Info,
        },
    )
    .at(at(seq as i64))
}

pub fn completed(seq: u64) -> ExecutionEvent {
    ExecutionEvent::new(
        seq,
        EventKind::Completed {
            summary: CompletionSummary::default(),
        },
    )
    .at(at(seq as i64))
}

pub fn failed(seq: u64, reason: &str) -> ExecutionEvent {
    ExecutionEvent::new(
        seq,
        EventKind::Failed {
            reason: reason.into(),
        },
    )
    .at(at(seq as i64))
}

pub fn running_snapshot(items_processed: u64) -> ExecutionSnapshot {
    ExecutionSnapshot::new(ExecutionStatus::Running).with_counters(Counters::processed(items_processed))
}
