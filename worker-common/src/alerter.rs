//! Failure alerter: per-queue consecutive-failure counter with webhook
//! dispatch and reset-on-success.
//!
//! The counter map is shared mutable state across consumers; mutations are
//! serialized behind a single mutex. Process-local by design: a restart
//! resets every queue's streak.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use tracing::warn;

use crate::job::QueueName;

#[derive(Debug, Clone, Serialize)]
struct AlertPayload<'a> {
    queue: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    job_id: Option<&'a str>,
    consecutive_failures: u32,
    message: &'a str,
    timestamp: String,
}

pub struct FailureAlerter {
    webhook_url: Option<String>,
    threshold: u32,
    client: reqwest::Client,
    counters: Mutex<HashMap<QueueName, u32>>,
}

impl FailureAlerter {
    pub fn new(webhook_url: Option<String>, threshold: u32) -> Self {
        // Threshold floor is 1; non-finite or non-positive values snap up.
        let threshold = threshold.max(1);
        Self {
            webhook_url,
            threshold,
            client: reqwest::Client::new(),
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure on `queue`. Dispatches the webhook and resets the
    /// counter iff this failure makes the running count exactly equal to
    /// `threshold`.
    pub async fn on_failure(&self, queue: QueueName, job_id: Option<&str>, message: &str) {
        let Some(webhook_url) = self.webhook_url.clone() else {
            return;
        };

        let fired = {
            let mut counters = self.counters.lock().expect("alerter mutex poisoned");
            let counter = counters.entry(queue).or_insert(0);
            *counter += 1;
            if *counter >= self.threshold {
                let count = *counter;
                *counter = 0;
                Some(count)
            } else {
                None
            }
        };

        let Some(consecutive_failures) = fired else {
            return;
        };

        let payload = AlertPayload {
            queue: queue.as_str(),
            job_id,
            consecutive_failures,
            message,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        if let Err(err) = self.client.post(&webhook_url).json(&payload).send().await {
            warn!(queue = queue.as_str(), error = %err, "failed to dispatch failure alert webhook");
        }
    }

    /// Reset the queue's consecutive-failure counter.
    pub fn on_success(&self, queue: QueueName) {
        let mut counters = self.counters.lock().expect("alerter mutex poisoned");
        counters.insert(queue, 0);
    }

    #[cfg(test)]
    fn counter(&self, queue: QueueName) -> u32 {
        *self
            .counters
            .lock()
            .expect("alerter mutex poisoned")
            .get(&queue)
            .unwrap_or(&0)
    }
}
