//! Broker abstraction. The source is tied to a single Redis-backed queue
//! library; this trait is the seam a Rust rewrite needs so the worker runtime
//! never depends on a particular backend.
//!
//! `InMemoryBroker` is a minimal reference implementation good enough to
//! drive the processors end-to-end in tests; a production deployment swaps
//! it for a durable (Redis- or Postgres-backed) implementation.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};

use crate::job::{JobPayload, JobRecord, QueueName};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("queue {0} is not registered on this broker")]
    UnknownQueue(QueueName),
    #[error("broker is shutting down")]
    Closed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PublishOpts {
    pub priority: Option<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct QueueDepth {
    pub waiting: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatusEvent {
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct JobOutcomeEvent {
    pub queue: QueueName,
    pub job_id: Option<String>,
    pub broker_id: String,
    pub status: JobStatusEvent,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A durable, named channel in the broker; one per job type.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Dequeue the next available job on `queue`, waiting if none is ready.
    async fn dequeue(&self, queue: QueueName) -> Result<JobRecord, BrokerError>;

    /// Enqueue a new job, returning the broker's internal id for it.
    async fn publish(
        &self,
        queue: QueueName,
        job_id: Option<String>,
        payload: JobPayload,
        opts: PublishOpts,
    ) -> Result<String, BrokerError>;

    /// Report the outcome of processing a previously dequeued job.
    async fn report_outcome(&self, event: JobOutcomeEvent) -> Result<(), BrokerError>;

    /// Current waiting/failed counts for `queue`, used by the monitoring endpoint.
    async fn queue_depth(&self, queue: QueueName) -> Result<QueueDepth, BrokerError>;

    /// Subscribe to completion/failure events across all queues.
    fn subscribe_outcomes(&self) -> broadcast::Receiver<JobOutcomeEvent>;
}

struct QueueState {
    waiting: VecDeque<JobRecord>,
    failed_count: u64,
}

impl QueueState {
    fn new() -> Self {
        Self {
            waiting: VecDeque::new(),
            failed_count: 0,
        }
    }
}

/// An in-process broker backed by a `Mutex<VecDeque<_>>` per queue and a
/// broadcast channel for outcome events. Good for tests and for the
/// zero-dependency "aha" path; not durable across restarts.
pub struct InMemoryBroker {
    queues: Mutex<HashMap<QueueName, QueueState>>,
    outcomes: broadcast::Sender<JobOutcomeEvent>,
    notify: Arc<tokio::sync::Notify>,
}

impl InMemoryBroker {
    pub fn new() -> Arc<Self> {
        let mut queues = HashMap::new();
        for queue in [
            QueueName::ContentGeneration,
            QueueName::LoraTraining,
            QueueName::VideoGeneration,
            QueueName::ImageGeneration,
        ] {
            queues.insert(queue, QueueState::new());
        }
        let (tx, _rx) = broadcast::channel(256);

        Arc::new(Self {
            queues: Mutex::new(queues),
            outcomes: tx,
            notify: Arc::new(tokio::sync::Notify::new()),
        })
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        unreachable!("use InMemoryBroker::new, which returns an Arc")
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn dequeue(&self, queue: QueueName) -> Result<JobRecord, BrokerError> {
        loop {
            {
                let mut queues = self.queues.lock().await;
                let state = queues.get_mut(&queue).ok_or(BrokerError::UnknownQueue(queue))?;
                if let Some(mut job) = state.waiting.pop_front() {
                    job.attempt += 1;
                    return Ok(job);
                }
            }
            self.notify.notified().await;
        }
    }

    async fn publish(
        &self,
        queue: QueueName,
        job_id: Option<String>,
        payload: JobPayload,
        _opts: PublishOpts,
    ) -> Result<String, BrokerError> {
        let broker_id = uuid::Uuid::new_v4().to_string();
        let record = JobRecord {
            broker_id: broker_id.clone(),
            job_id,
            queue,
            payload,
            attempt: 0,
        };

        let mut queues = self.queues.lock().await;
        let state = queues.get_mut(&queue).ok_or(BrokerError::UnknownQueue(queue))?;
        state.waiting.push_back(record);
        drop(queues);
        self.notify.notify_waiters();

        Ok(broker_id)
    }

    async fn report_outcome(&self, event: JobOutcomeEvent) -> Result<(), BrokerError> {
        if event.status == JobStatusEvent::Failed {
            let mut queues = self.queues.lock().await;
            if let Some(state) = queues.get_mut(&event.queue) {
                state.failed_count += 1;
            }
        }
        // No receivers is a normal, non-error state (e.g. in a test that
        // doesn't care about outcomes).
        let _ = self.outcomes.send(event);
        Ok(())
    }

    async fn queue_depth(&self, queue: QueueName) -> Result<QueueDepth, BrokerError> {
        let queues = self.queues.lock().await;
        let state = queues.get(&queue).ok_or(BrokerError::UnknownQueue(queue))?;
        Ok(QueueDepth {
            waiting: state.waiting.len() as u64,
            failed: state.failed_count,
        })
    }

    fn subscribe_outcomes(&self) -> broadcast::Receiver<JobOutcomeEvent> {
        self.outcomes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ContentGenerationPayload;

    #[tokio::test]
    async fn publish_then_dequeue_round_trips() {
        let broker = InMemoryBroker::new();
        let payload = JobPayload::ContentGeneration(ContentGenerationPayload {
            persona: Some("persona".into()),
            persona_text: None,
            context: Some("launch".into()),
            theme: None,
            duration_sec: Some(45),
        });

        broker
            .publish(
                QueueName::ContentGeneration,
                Some("job-1".into()),
                payload,
                PublishOpts::default(),
            )
            .await
            .unwrap();

        let job = broker.dequeue(QueueName::ContentGeneration).await.unwrap();
        assert_eq!(job.job_id.as_deref(), Some("job-1"));
        assert_eq!(job.attempt, 1);
    }

    #[tokio::test]
    async fn failed_outcome_increments_queue_depth_failed_count() {
        let broker = InMemoryBroker::new();
        broker
            .report_outcome(JobOutcomeEvent {
                queue: QueueName::VideoGeneration,
                job_id: Some("job-1".into()),
                broker_id: "b-1".into(),
                status: JobStatusEvent::Failed,
                processed_at: None,
                finished_at: None,
            })
            .await
            .unwrap();

        let depth = broker.queue_depth(QueueName::VideoGeneration).await.unwrap();
        assert_eq!(depth.failed, 1);
    }
}
