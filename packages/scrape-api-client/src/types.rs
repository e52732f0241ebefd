use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Input for launching a scraping execution.
#[derive(Debug, Clone, Serialize)]
pub struct StartExecutionInput {
    #[serde(rename = "actorId")]
    pub actor_id: String,
    pub input: serde_json::Value,
    #[serde(rename = "maxItems", skip_serializing_if = "Option::is_none")]
    pub max_items: Option<u64>,
}

impl StartExecutionInput {
    pub fn new(actor_id: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            actor_id: actor_id.into(),
            input,
            max_items: None,
        }
    }

    pub fn with_max_items(mut self, max_items: u64) -> Self {
        self.max_items = Some(max_items);
        self
    }
}

/// Wrapper for API responses.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    pub data: T,
}

/// Lifecycle status as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum RunStatus {
    Ready,
    Running,
    Paused,
    Succeeded,
    Failed,
    Aborting,
    Aborted,
    TimingOut,
    TimedOut,
    #[serde(other)]
    Unknown,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Aborted | RunStatus::TimedOut
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Ready => "READY",
            RunStatus::Running => "RUNNING",
            RunStatus::Paused => "PAUSED",
            RunStatus::Succeeded => "SUCCEEDED",
            RunStatus::Failed => "FAILED",
            RunStatus::Aborting => "ABORTING",
            RunStatus::Aborted => "ABORTED",
            RunStatus::TimingOut => "TIMING-OUT",
            RunStatus::TimedOut => "TIMED-OUT",
            RunStatus::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters reported for a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RunStats {
    #[serde(rename = "itemsProcessed", default)]
    pub items_processed: u64,
    #[serde(rename = "itemsFailed", default)]
    pub items_failed: u64,
    #[serde(rename = "requestsMade", default)]
    pub requests_made: u64,
    #[serde(rename = "itemsTotal", default)]
    pub items_total: Option<u64>,
}

/// A document the run has discovered so far, in canonical server order.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RunDocument {
    pub id: String,
    pub url: Option<String>,
    pub title: Option<String>,
    #[serde(rename = "contentType")]
    pub content_type: Option<String>,
    #[serde(rename = "discoveredAt")]
    pub discovered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Execution run metadata and point-in-time state.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionRun {
    pub id: String,
    pub status: RunStatus,
    #[serde(rename = "statusMessage")]
    pub status_message: Option<String>,
    #[serde(rename = "startedAt")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(rename = "finishedAt")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stats: RunStats,
    pub phase: Option<String>,
    #[serde(default)]
    pub documents: Vec<RunDocument>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_run_with_documents() {
        let body = serde_json::json!({
            "data": {
                "id": "run-1",
                "status": "TIMED-OUT",
                "startedAt": "2024-05-01T10:00:00Z",
                "finishedAt": "2024-05-01T10:05:00Z",
                "stats": { "itemsProcessed": 12, "requestsMade": 40 },
                "documents": [
                    { "id": "doc-a", "url": "https://example.org/a", "metadata": { "lang": "en" } }
                ]
            }
        });

        let resp: ApiResponse<ExecutionRun> = serde_json::from_value(body).unwrap();
        let run = resp.data;
        assert_eq!(run.status, RunStatus::TimedOut);
        assert!(run.status.is_terminal());
        assert_eq!(run.stats.items_processed, 12);
        assert_eq!(run.stats.items_failed, 0);
        assert_eq!(run.stats.items_total, None);
        assert_eq!(run.documents.len(), 1);
        assert_eq!(run.documents[0].metadata["lang"], "en");
    }

    #[test]
    fn unrecognized_status_maps_to_unknown() {
        let status: RunStatus = serde_json::from_str("\"HIBERNATING\"").unwrap();
        assert_eq!(status, RunStatus::Unknown);
        assert!(!status.is_terminal());
    }

    #[test]
    fn start_input_omits_unset_limit() {
        let input = StartExecutionInput::new("site-crawler", serde_json::json!({"url": "x"}));
        let value = serde_json::to_value(&input).unwrap();
        assert_eq!(value["actorId"], "site-crawler");
        assert!(value.get("maxItems").is_none());

        let value = serde_json::to_value(input.with_max_items(50)).unwrap();
        assert_eq!(value["maxItems"], 50);
    }
}
