//! Thin HTTP client for the orchestrator API, used by the CLI.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::api::{CancelJobRequest, ErrorResponse, JobStatusResponse, SubmitJobResponse};
use crate::capacity::PoolSummary;
use crate::error::{BatchError, Result};
use crate::orchestrator::SubmitRequest;
use crate::scheduler::job::{JobRun, JobState};
use crate::scheduler::QueueSummary;

#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: String,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        let message = match response.json::<ErrorResponse>().await {
            Ok(body) => body.error,
            Err(_) => status.canonical_reason().unwrap_or("unknown error").to_string(),
        };
        Err(BatchError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.http.get(self.url(path)).send().await?;
        Self::decode(response).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let response = self.http.post(self.url(path)).json(body).send().await?;
        Self::decode(response).await
    }

    pub async fn submit(&self, request: &SubmitRequest) -> Result<String> {
        let response: SubmitJobResponse = self.post("/api/jobs", request).await?;
        Ok(response.job_id)
    }

    pub async fn job_status(&self, job_id: &str) -> Result<JobStatusResponse> {
        self.get(&format!("/api/jobs/{}", job_id)).await
    }

    pub async fn cancel(&self, job_id: &str, reason: Option<String>) -> Result<JobRun> {
        self.post(
            &format!("/api/jobs/{}/cancel", job_id),
            &CancelJobRequest { reason },
        )
        .await
    }

    pub async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<JobRun>> {
        match state {
            Some(state) => self.get(&format!("/api/jobs?state={}", state)).await,
            None => self.get("/api/jobs").await,
        }
    }

    pub async fn list_queues(&self) -> Result<Vec<QueueSummary>> {
        self.get("/api/queues").await
    }

    pub async fn list_pools(&self) -> Result<Vec<PoolSummary>> {
        self.get("/api/pools").await
    }
}
