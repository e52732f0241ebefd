//! Error taxonomy for execution tracking.
//!
//! Only `ChannelUnavailable`, `Launch` and `Config` are ever returned to a
//! caller. The others describe conditions the tracker handles internally:
//! they are logged and reflected in `connection_state` (or, for rejected
//! events, nowhere at all).

use scrape_api_client::ApiError;
use thiserror::Error;

use crate::types::{ExecutionId, ExecutionStatus};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Event channel unavailable for execution {execution_id}: {reason}")]
    ChannelUnavailable {
        execution_id: ExecutionId,
        reason: String,
    },

    #[error("Event channel dropped: {0}")]
    ChannelDropped(String),

    #[error("Snapshot fetch failed: {0}")]
    SnapshotFetchFailed(String),

    #[error("Stale {event} event discarded: sequence {sequence} <= {last_accepted}")]
    StaleEventDiscarded {
        event: &'static str,
        sequence: u64,
        last_accepted: u64,
    },

    #[error("{event} event (sequence {sequence}) rejected: execution already {status}")]
    TerminalStateViolation {
        event: &'static str,
        sequence: u64,
        status: ExecutionStatus,
    },

    #[error("Failed to launch execution: {0}")]
    Launch(#[source] ApiError),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_event_message_carries_sequences() {
        let err = TrackerError::StaleEventDiscarded {
            event: "progress",
            sequence: 2,
            last_accepted: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("progress"));
        assert!(msg.contains("2 <= 3"));
    }

    #[test]
    fn terminal_violation_names_status() {
        let err = TrackerError::TerminalStateViolation {
            event: "progress",
            sequence: 8,
            status: ExecutionStatus::Completed,
        };
        assert!(err.to_string().contains("already completed"));
    }

    #[test]
    fn launch_error_exposes_source() {
        use std::error::Error as _;
        let err = TrackerError::Launch(ApiError::NotFound("x".into()));
        assert!(err.source().is_some());
    }
}
