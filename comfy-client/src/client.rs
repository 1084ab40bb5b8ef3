use std::time::Duration;

use graph_workflow::ComfyWorkflow;
use serde_json::Value;

use crate::error::ComfyError;
use crate::history::{derive_status, locate_asset, resolve_history_entry, JobOutcome};
use crate::types::{AssetBias, PromptOutcome, SubmitRequest, SubmitResponse};

const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
const DEFAULT_MAX_POLL_ATTEMPTS: u32 = 120;
const SUBMIT_MAX_ATTEMPTS: u32 = 3;
const SUBMIT_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct ComfyClientConfig {
    pub base_url: String,
    pub client_id: String,
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
}

impl ComfyClientConfig {
    pub fn new(base_url: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client_id: client_id.into(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            max_poll_attempts: DEFAULT_MAX_POLL_ATTEMPTS,
        }
    }
}

pub struct ComfyClient {
    http: reqwest::Client,
    config: ComfyClientConfig,
}

impl ComfyClient {
    pub fn new(config: ComfyClientConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn with_client(http: reqwest::Client, config: ComfyClientConfig) -> Self {
        Self { http, config }
    }

    /// Submit `workflow` (augmented with `metadata`) and poll until the job
    /// reaches a terminal state, then download the produced asset.
    ///
    /// `workflow` is never mutated; a fresh JSON value is built for the
    /// request body each call.
    pub async fn submit_and_wait(
        &self,
        workflow: &ComfyWorkflow,
        metadata: Value,
        bias: AssetBias,
    ) -> Result<PromptOutcome, ComfyError> {
        let prompt_id = self.submit(workflow, &metadata).await?;
        let entry = self.poll_until_terminal(&prompt_id).await?;
        let asset = locate_asset(&entry, bias).ok_or(ComfyError::NoAssetFound)?;
        let download_url = self.build_download_url(&asset);
        let bytes = self.download(&download_url).await?;

        Ok(PromptOutcome {
            prompt_id,
            download_url,
            bytes,
        })
    }

    async fn submit(&self, workflow: &ComfyWorkflow, metadata: &Value) -> Result<String, ComfyError> {
        let mut prompt = serde_json::to_value(workflow).expect("ComfyWorkflow is always serializable");
        if let Value::Object(ref mut map) = prompt {
            if let Value::Object(meta_map) = metadata.clone() {
                for (k, v) in meta_map {
                    map.insert(k, v);
                }
            }
        }

        let url = format!("{}/prompt", self.config.base_url.trim_end_matches('/'));
        let body = SubmitRequest {
            client_id: &self.config.client_id,
            prompt: &prompt,
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let send_result = self.http.post(&url).json(&body).send().await;

            let response = match send_result {
                Ok(r) => r,
                Err(_) => return Err(ComfyError::Unreachable(self.config.base_url.clone())),
            };

            let status = response.status();
            if status.is_success() {
                let parsed: SubmitResponse = response.json().await?;
                return parsed.extracted_prompt_id().ok_or(ComfyError::MissingPromptId);
            }

            if status.as_u16() == 503 && attempt < SUBMIT_MAX_ATTEMPTS {
                tokio::time::sleep(SUBMIT_RETRY_DELAY * attempt).await;
                continue;
            }

            let body_text = response.text().await.unwrap_or_default();
            return Err(ComfyError::Http {
                status: status.as_u16(),
                body: body_text,
            });
        }
    }

    async fn poll_until_terminal(&self, prompt_id: &str) -> Result<Value, ComfyError> {
        let url = format!(
            "{}/history/{}",
            self.config.base_url.trim_end_matches('/'),
            prompt_id
        );

        for _ in 0..self.config.max_poll_attempts {
            let response = self.http.get(&url).send().await?;

            if response.status().as_u16() == 404 {
                tokio::time::sleep(self.config.poll_interval).await;
                continue;
            }

            let parsed: Value = match response.json().await {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, %prompt_id, "failed to parse /history response, treating as transient");
                    tokio::time::sleep(self.config.poll_interval).await;
                    continue;
                }
            };

            let Some(entry) = resolve_history_entry(&parsed, prompt_id) else {
                tokio::time::sleep(self.config.poll_interval).await;
                continue;
            };

            match derive_status(entry) {
                JobOutcome::Succeeded => return Ok(entry.clone()),
                JobOutcome::Failed(message) => return Err(ComfyError::JobFailed(message)),
                JobOutcome::Pending => {
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }

        Err(ComfyError::Timeout(prompt_id.to_string()))
    }

    fn build_download_url(&self, asset: &crate::types::AssetRef) -> String {
        if let Some(url) = &asset.url {
            if url.starts_with("http://") || url.starts_with("https://") {
                return url.clone();
            }
        }

        let filename = asset.filename.clone().unwrap_or_default();
        format!(
            "{}/view?filename={}&subfolder={}&type={}",
            self.config.base_url.trim_end_matches('/'),
            urlencode(&filename),
            urlencode(&asset.subfolder),
            urlencode(&asset.asset_type)
        )
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, ComfyError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ComfyError::Download(url.to_string(), e))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ComfyError::Download(url.to_string(), e))?;
        Ok(bytes.to_vec())
    }
}

fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use graph_workflow::ComfyWorkflow;
    use httpmock::prelude::*;
    use serde_json::json;

    fn test_config(server: &MockServer) -> ComfyClientConfig {
        let mut config = ComfyClientConfig::new(server.base_url(), "test-client");
        config.poll_interval = Duration::from_millis(1);
        config.max_poll_attempts = 5;
        config
    }

    #[tokio::test]
    async fn happy_path_submits_polls_and_downloads() {
        let server = MockServer::start();

        let submit_mock = server.mock(|when, then| {
            when.method(POST).path("/prompt");
            then.status(200).json_body(json!({ "prompt_id": "job-123" }));
        });

        let history_mock = server.mock(|when, then| {
            when.method(GET).path("/history/job-123");
            then.status(200).json_body(json!({
                "job-123": {
                    "status": { "status": "completed", "completed": true },
                    "outputs": {
                        "9": { "videos": [{ "filename": "result.mp4", "subfolder": "videos", "type": "video" }] }
                    }
                }
            }));
        });

        let download_mock = server.mock(|when, then| {
            when.method(GET).path("/view");
            then.status(200).body(b"video-bytes".to_vec());
        });

        let client = ComfyClient::new(test_config(&server));
        let workflow = ComfyWorkflow::new();
        let metadata = json!({ "extra_data": { "metadata": { "workflow": "custom" } } });

        let outcome = client
            .submit_and_wait(&workflow, metadata, AssetBias::Video)
            .await
            .unwrap();

        assert_eq!(outcome.prompt_id, "job-123");
        assert!(outcome.download_url.contains("/view?filename=result.mp4"));
        assert_eq!(outcome.bytes, b"video-bytes".to_vec());
        submit_mock.assert_hits(1);
        history_mock.assert_hits(1);
        download_mock.assert_hits(1);
    }

    #[tokio::test]
    async fn missing_prompt_id_is_fatal() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/prompt");
            then.status(200).json_body(json!({}));
        });

        let client = ComfyClient::new(test_config(&server));
        let result = client
            .submit_and_wait(&ComfyWorkflow::new(), json!({}), AssetBias::Image)
            .await;

        assert!(matches!(result, Err(ComfyError::MissingPromptId)));
    }

    #[tokio::test]
    async fn history_404_is_treated_as_not_yet_available() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/prompt");
            then.status(200).json_body(json!({ "id": "job-9" }));
        });

        let pending_then_done = server.mock(|when, then| {
            when.method(GET).path("/history/job-9");
            then.status(404);
        });

        let client = ComfyClient::new(test_config(&server));
        let result = client
            .submit_and_wait(&ComfyWorkflow::new(), json!({}), AssetBias::Image)
            .await;

        assert!(matches!(result, Err(ComfyError::Timeout(ref id)) if id == "job-9"));
        pending_then_done.assert_hits(5);
    }

    #[tokio::test]
    async fn failed_status_surfaces_job_failed_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/prompt");
            then.status(200).json_body(json!({ "prompt_id": "job-err" }));
        });
        server.mock(|when, then| {
            when.method(GET).path("/history/job-err");
            then.status(200).json_body(json!({
                "job-err": { "status": { "status": "failed", "error": "out of memory" } }
            }));
        });

        let client = ComfyClient::new(test_config(&server));
        let result = client
            .submit_and_wait(&ComfyWorkflow::new(), json!({}), AssetBias::Image)
            .await;

        assert!(matches!(result, Err(ComfyError::JobFailed(ref m)) if m == "out of memory"));
    }
}
