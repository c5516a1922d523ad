//! HTTP Backend
//!
//! Reqwest-based implementation of [`TranscriptionBackend`] against the
//! backend's REST job API. Errors are classified at this boundary: network
//! failures, timeouts and 5xx/429 responses are transient; other 4xx
//! responses are rejections and never retried.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{JobAction, SplitBatchResponse, TranscriptionBackend};
use crate::jobs::RawJobRecord;
use crate::settings::TranscribeSettings;
use crate::{EngineError, EngineResult, JobId};

/// Request timeout for all job API calls
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    detail: Option<String>,
}

/// HTTP implementation of the backend job contract
pub struct HttpBackend {
    /// HTTP client with configured timeout
    client: reqwest::Client,
    /// Base URL of the backend API
    base_url: String,
}

impl std::fmt::Debug for HttpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBackend")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpBackend {
    /// Creates a new backend client for the given base URL.
    pub fn new(base_url: impl Into<String>) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| EngineError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn status_url(&self, job_id: JobId) -> String {
        format!("{}/jobs/{}/status", self.base_url, job_id)
    }

    fn action_url(&self, job_id: JobId, action: JobAction) -> String {
        format!("{}/jobs/{}/action?action={}", self.base_url, job_id, action)
    }

    fn clear_url(&self, job_id: JobId) -> String {
        format!("{}/jobs/{}", self.base_url, job_id)
    }

    fn split_url(&self, job_id: JobId) -> String {
        format!("{}/jobs/{}/split-batch", self.base_url, job_id)
    }

    /// Classifies a non-success response into the engine error taxonomy.
    fn parse_api_error(status: StatusCode, body: &str) -> EngineError {
        let detail = match serde_json::from_str::<ApiErrorResponse>(body) {
            Ok(parsed) => parsed
                .error
                .or(parsed.detail)
                .unwrap_or_else(|| body.chars().take(200).collect()),
            Err(_) => body.chars().take(200).collect(),
        };

        let message = format!("{}: {}", status, detail);
        if status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
            || status.is_server_error()
        {
            EngineError::Transient(message)
        } else {
            EngineError::Rejected(message)
        }
    }

    fn network_error(e: reqwest::Error) -> EngineError {
        EngineError::Transient(format!("Network error: {}", e))
    }

    async fn read_error(resp: reqwest::Response) -> EngineError {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Self::parse_api_error(status, &body)
    }
}

#[async_trait]
impl TranscriptionBackend for HttpBackend {
    async fn fetch_status(&self, job_id: JobId) -> EngineResult<RawJobRecord> {
        let resp = self
            .client
            .get(self.status_url(job_id))
            .send()
            .await
            .map_err(Self::network_error)?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(EngineError::JobNotFound(job_id));
        }
        if !resp.status().is_success() {
            return Err(Self::read_error(resp).await);
        }

        let record = resp
            .json::<RawJobRecord>()
            .await
            .map_err(|e| EngineError::Transient(format!("Failed to parse status: {}", e)))?;

        debug!("Fetched status for job {}: {:?}", job_id, record.status);
        Ok(record)
    }

    async fn submit_action(
        &self,
        job_id: JobId,
        action: JobAction,
        settings: Option<&TranscribeSettings>,
    ) -> EngineResult<()> {
        let resp = match action {
            JobAction::Clear => self
                .client
                .delete(self.clear_url(job_id))
                .send()
                .await
                .map_err(Self::network_error)?,
            _ => {
                let mut req = self.client.post(self.action_url(job_id, action));
                if let Some(settings) = settings {
                    req = req.json(settings);
                }
                req.send().await.map_err(Self::network_error)?
            }
        };

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(EngineError::JobNotFound(job_id));
        }
        if !resp.status().is_success() {
            return Err(Self::read_error(resp).await);
        }

        debug!("Submitted action {} for job {}", action, job_id);
        Ok(())
    }

    async fn split_batch(&self, job_id: JobId) -> EngineResult<SplitBatchResponse> {
        let resp = self
            .client
            .post(self.split_url(job_id))
            .send()
            .await
            .map_err(Self::network_error)?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(EngineError::JobNotFound(job_id));
        }
        if !resp.status().is_success() {
            return Err(Self::read_error(resp).await);
        }

        resp.json::<SplitBatchResponse>()
            .await
            .map_err(|e| EngineError::Transient(format!("Failed to parse split response: {}", e)))
    }
}
