//! Worker runtime / supervisor: wires every queue to its processor
//! with the shared `ProcessorContext`, attaches completion/failure
//! listeners to the failure alerter, and launches the monitoring endpoint.
//!
//! Follows `embedding-worker::main`'s consumer-loop shape (dequeue, process,
//! report, repeat), generalized to one loop per queue with a semaphore
//! bounding per-queue concurrency.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use chrono::Utc;
use time::Duration as TimeDuration;
use tokio::sync::Semaphore;
use tracing::{error, info};

use worker_common::alerter::FailureAlerter;
use worker_common::broker::{Broker, JobOutcomeEvent, JobStatusEvent};
use worker_common::health::HealthRegistry;
use worker_common::job::{JobRecord, JobStatus, QueueName};
use worker_common::status::StatusPatch;

use crate::error::ProcessorError;
use crate::processors::{content_generation, image_generation, lora_training, video_generation, ProcessorContext};

/// How long a queue consumer may go without reporting healthy before its
/// liveness probe is considered stalled.
const LIVENESS_DEADLINE: TimeDuration = TimeDuration::seconds(120);

pub struct Supervisor {
    broker: Arc<dyn Broker>,
    ctx: ProcessorContext,
    alerter: Arc<FailureAlerter>,
    liveness: HealthRegistry,
    concurrency_per_queue: usize,
    image_generation_enabled: bool,
}

impl Supervisor {
    pub fn new(
        broker: Arc<dyn Broker>,
        ctx: ProcessorContext,
        alerter: Arc<FailureAlerter>,
        liveness: HealthRegistry,
        concurrency_per_queue: usize,
        image_generation_enabled: bool,
    ) -> Self {
        Self {
            broker,
            ctx,
            alerter,
            liveness,
            concurrency_per_queue,
            image_generation_enabled,
        }
    }

    fn active_queues(&self) -> Vec<QueueName> {
        let mut queues = vec![
            QueueName::ContentGeneration,
            QueueName::LoraTraining,
            QueueName::VideoGeneration,
        ];
        if self.image_generation_enabled {
            queues.push(QueueName::ImageGeneration);
        }
        queues
    }

    /// Spawn one consumer loop per active queue, then spawn the monitoring
    /// endpoint. Both run for the lifetime of the process; a monitoring
    /// failure is logged and ignored rather than taking down the queue
    /// consumers.
    pub async fn run(self, monitoring_router: Router, monitoring_bind: String) {
        for queue in self.active_queues() {
            let broker = self.broker.clone();
            let ctx = self.ctx.clone();
            let alerter = self.alerter.clone();
            let liveness = self.liveness.clone();
            let concurrency = self.concurrency_per_queue.max(1);
            info!(queue = queue.as_str(), concurrency, "starting queue consumer");
            tokio::spawn(run_queue_consumer(queue, broker, ctx, alerter, liveness, concurrency));
        }

        tokio::spawn(async move {
            info!(bind = %monitoring_bind, "starting monitoring endpoint");
            if let Err(err) = worker_common::monitoring::serve(monitoring_router, &monitoring_bind).await {
                error!(error = %err, "monitoring endpoint exited");
            }
        });
    }
}

async fn run_queue_consumer(
    queue: QueueName,
    broker: Arc<dyn Broker>,
    ctx: ProcessorContext,
    alerter: Arc<FailureAlerter>,
    liveness: HealthRegistry,
    concurrency: usize,
) {
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let health = liveness.register(queue.as_str().to_string(), LIVENESS_DEADLINE).await;

    loop {
        health.report_healthy().await;

        let job = match broker.dequeue(queue).await {
            Ok(job) => job,
            Err(err) => {
                error!(queue = queue.as_str(), error = %err, "broker dequeue failed, backing off");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        health.report_healthy().await;

        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore is never closed");

        let broker = broker.clone();
        let ctx = ctx.clone();
        let alerter = alerter.clone();

        tokio::spawn(async move {
            let _permit = permit;
            handle_job(queue, &broker, &ctx, &alerter, job).await;
        });
    }
}

async fn handle_job(
    queue: QueueName,
    broker: &Arc<dyn Broker>,
    ctx: &ProcessorContext,
    alerter: &Arc<FailureAlerter>,
    job: JobRecord,
) {
    let job_id = job.job_id.clone();
    let broker_id = job.broker_id.clone();
    let processed_at = Utc::now();

    let result = dispatch(ctx, &job, queue).await;
    let finished_at = Utc::now();

    match result {
        Ok(()) => {
            alerter.on_success(queue);
            let _ = broker
                .report_outcome(JobOutcomeEvent {
                    queue,
                    job_id,
                    broker_id,
                    status: JobStatusEvent::Completed,
                    processed_at: Some(processed_at),
                    finished_at: Some(finished_at),
                })
                .await;
        }
        Err(err) => {
            let message = err.to_string();
            error!(
                queue = queue.as_str(),
                broker_id = %broker_id,
                job_id = ?job_id,
                error = %message,
                "job failed"
            );

            // Best-effort: the processor already attempted its own terminal
            // patch; this is a second, idempotent safety net in case it
            // crashed before reaching one (see DESIGN.md).
            if let Some(id) = &job_id {
                ctx.status
                    .patch(id, StatusPatch::status(JobStatus::Failed).with_result(err.to_result_json()))
                    .await;
            }

            alerter.on_failure(queue, job_id.as_deref(), &message).await;

            let _ = broker
                .report_outcome(JobOutcomeEvent {
                    queue,
                    job_id,
                    broker_id,
                    status: JobStatusEvent::Failed,
                    processed_at: Some(processed_at),
                    finished_at: Some(finished_at),
                })
                .await;
        }
    }
}

async fn dispatch(ctx: &ProcessorContext, job: &JobRecord, queue: QueueName) -> Result<(), ProcessorError> {
    match queue {
        QueueName::ContentGeneration => content_generation::process(ctx, job).await,
        QueueName::LoraTraining => lora_training::process(ctx, job).await,
        QueueName::VideoGeneration => video_generation::process(ctx, job).await,
        QueueName::ImageGeneration => image_generation::process(ctx, job).await,
    }
}
