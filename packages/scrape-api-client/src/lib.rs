//! REST client for the remote scraping platform.
//!
//! Supports launching executions and fetching a point-in-time snapshot of an
//! execution.
//!
//! # Example
//!
//! ```rust,ignore
//! use scrape_api_client::{ScrapeApiClient, StartExecutionInput};
//!
//! let client = ScrapeApiClient::new("your-api-token".into());
//!
//! let run = client
//!     .start_execution(&StartExecutionInput::new("site-crawler", serde_json::json!({"url": "https://example.org"})))
//!     .await?;
//! let snapshot = client.get_execution(&run.id).await?;
//! println!("{} items processed", snapshot.stats.items_processed);
//! ```

pub mod error;
pub mod types;

pub use error::{ApiError, Result};
pub use types::{ExecutionRun, RunDocument, RunStats, RunStatus, StartExecutionInput};

use serde::de::DeserializeOwned;
use types::ApiResponse;

const DEFAULT_BASE_URL: &str = "http://localhost:8080/v1";

#[derive(Clone)]
pub struct ScrapeApiClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl ScrapeApiClient {
    pub fn new(token: String) -> Self {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: impl Into<String>, token: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Launch an execution. Returns immediately with run metadata.
    pub async fn start_execution(&self, input: &StartExecutionInput) -> Result<ExecutionRun> {
        let url = format!("{}/executions", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(input)
            .send()
            .await?;

        let run: ExecutionRun = Self::read_data(resp, None).await?;
        tracing::info!(execution_id = %run.id, actor_id = %input.actor_id, "Execution started");
        Ok(run)
    }

    /// Fetch the current authoritative state of an execution.
    pub async fn get_execution(&self, execution_id: &str) -> Result<ExecutionRun> {
        let url = format!("{}/executions/{}", self.base_url, execution_id);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;

        Self::read_data(resp, Some(execution_id)).await
    }

    async fn read_data<T: DeserializeOwned>(
        resp: reqwest::Response,
        execution_id: Option<&str>,
    ) -> Result<T> {
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            if let Some(id) = execution_id {
                return Err(ApiError::NotFound(id.to_string()));
            }
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let api_resp: ApiResponse<T> = resp.json().await?;
        Ok(api_resp.data)
    }
}

impl std::fmt::Debug for ScrapeApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScrapeApiClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}
