//! Status reporter and the control-plane client it sits on top of.
//!
//! `patch` is best-effort: up to 2 attempts with linear `200ms * attempt`
//! backoff, logging a warning and returning normally on final failure so a
//! flaky control plane never holds up a processor.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::job::{JobStatus, Progress};

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("control-plane request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("control plane returned {status}: {body}")]
    Http { status: u16, body: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "costTokens")]
    pub cost_tokens: Option<u64>,
}

impl StatusPatch {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            result: None,
            cost_tokens: None,
        }
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_cost_tokens(mut self, cost_tokens: u64) -> Self {
        self.cost_tokens = Some(cost_tokens);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateJobRequest {
    #[serde(rename = "type")]
    pub job_type: String,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateAssetRequest {
    pub job_id: String,
    #[serde(rename = "type")]
    pub asset_type: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct DatasetRecord {
    pub dataset_path: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct LoraConfigRecord {
    #[serde(flatten)]
    pub config: crate::job::LoraTrainingConfig,
}

/// Thin HTTP client for the control-plane API. `None` base url means "disabled",
/// used by tests so the progress throttler and processors can run without a
/// live control plane.
#[derive(Clone)]
pub struct ControlPlaneClient {
    client: reqwest::Client,
    base_url: Option<String>,
}

impl ControlPlaneClient {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: Some(base_url),
        }
    }

    pub fn disabled() -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: None,
        }
    }

    async fn patch_job(&self, job_id: &str, patch: &StatusPatch) -> Result<(), StatusError> {
        let Some(base_url) = &self.base_url else {
            return Ok(());
        };
        let url = format!("{}/jobs/{}", base_url.trim_end_matches('/'), job_id);
        let response = self.client.patch(&url).json(patch).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(StatusError::Http { status, body });
        }
        Ok(())
    }

    pub async fn create_job(&self, req: CreateJobRequest) -> Result<String, StatusError> {
        let Some(base_url) = &self.base_url else {
            return Ok(format!("local-{}", uuid::Uuid::new_v4()));
        };
        let url = format!("{}/jobs", base_url.trim_end_matches('/'));
        let response = self.client.post(&url).json(&req).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(StatusError::Http { status, body });
        }
        #[derive(serde::Deserialize)]
        struct CreatedJob {
            id: String,
        }
        let created: CreatedJob = response.json().await?;
        Ok(created.id)
    }

    pub async fn get_dataset(&self, id: &str) -> Result<DatasetRecord, StatusError> {
        let base_url = self.base_url.as_deref().unwrap_or_default();
        let url = format!("{}/datasets/{}", base_url.trim_end_matches('/'), id);
        let response = self.client.get(&url).send().await?;
        Ok(response.json().await?)
    }

    pub async fn get_lora_config(&self, id: &str) -> Result<LoraConfigRecord, StatusError> {
        let base_url = self.base_url.as_deref().unwrap_or_default();
        let url = format!("{}/lora-configs/{}", base_url.trim_end_matches('/'), id);
        let response = self.client.get(&url).send().await?;
        Ok(response.json().await?)
    }

    pub async fn create_asset(&self, req: CreateAssetRequest) -> Result<(), StatusError> {
        let Some(base_url) = &self.base_url else {
            return Ok(());
        };
        let url = format!("{}/assets", base_url.trim_end_matches('/'));
        let response = self.client.post(&url).json(&req).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(StatusError::Http { status, body });
        }
        Ok(())
    }
}

/// Idempotent status/result patches to the control plane with bounded retry.
#[derive(Clone)]
pub struct StatusReporter {
    client: ControlPlaneClient,
}

impl StatusReporter {
    pub fn new(client: ControlPlaneClient) -> Self {
        Self { client }
    }

    /// Best-effort patch: up to 2 attempts, 200ms * attempt linear backoff.
    /// Never propagates a failure to the caller.
    pub async fn patch(&self, job_id: &str, patch: StatusPatch) {
        const MAX_ATTEMPTS: u32 = 2;

        for attempt in 1..=MAX_ATTEMPTS {
            match self.client.patch_job(job_id, &patch).await {
                Ok(()) => return,
                Err(err) => {
                    if attempt == MAX_ATTEMPTS {
                        warn!(job_id, error = %err, "status patch failed after retries, giving up");
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
                }
            }
        }
    }

    /// Convenience used by the progress throttler: a `running` patch carrying
    /// the progress event as `result.progress`.
    pub async fn patch_progress(&self, job_id: &str, progress: Progress) {
        let patch = StatusPatch::status(JobStatus::Running)
            .with_result(serde_json::json!({ "progress": progress }));
        self.patch(job_id, patch).await;
    }

    pub fn control_plane(&self) -> &ControlPlaneClient {
        &self.client
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn patch_succeeds_on_first_attempt() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(PATCH).path("/jobs/job-1");
            then.status(200);
        });

        let reporter = StatusReporter::new(ControlPlaneClient::new(server.base_url()));
        reporter
            .patch("job-1", StatusPatch::status(JobStatus::Running))
            .await;

        mock.assert_hits(1);
    }

    #[tokio::test]
    async fn patch_retries_once_then_gives_up_silently() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(PATCH).path("/jobs/job-2");
            then.status(500);
        });

        let reporter = StatusReporter::new(ControlPlaneClient::new(server.base_url()));
        reporter
            .patch("job-2", StatusPatch::status(JobStatus::Failed))
            .await;

        mock.assert_hits(2);
    }

    #[tokio::test]
    async fn disabled_client_is_a_no_op() {
        let reporter = StatusReporter::new(ControlPlaneClient::disabled());
        reporter
            .patch("job-3", StatusPatch::status(JobStatus::Succeeded))
            .await;
    }

    #[tokio::test]
    async fn create_job_posts_payload_and_returns_id() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/jobs");
            then.status(200).json_body(serde_json::json!({ "id": "child-123" }));
        });

        let client = ControlPlaneClient::new(server.base_url());
        let id = client
            .create_job(CreateJobRequest {
                job_type: "video-generation".to_string(),
                payload: serde_json::json!({}),
                priority: Some(5),
            })
            .await
            .unwrap();

        assert_eq!(id, "child-123");
    }

    #[tokio::test]
    async fn disabled_client_create_job_returns_local_id() {
        let client = ControlPlaneClient::disabled();
        let id = client
            .create_job(CreateJobRequest {
                job_type: "video-generation".to_string(),
                payload: serde_json::json!({}),
                priority: None,
            })
            .await
            .unwrap();

        assert!(id.starts_with("local-"));
    }
}
