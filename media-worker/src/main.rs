//! Entry point: builds every collaborator from `Config`, wires the
//! supervisor to the in-process broker, and serves the monitoring
//! endpoint until the process receives a shutdown signal.

use std::future::ready;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;

use comfy_client::{ComfyClient, ComfyClientConfig};
use graph_workflow::ComfyWorkflow;
use media_worker::config::Config;
use media_worker::processors::ProcessorContext;
use media_worker::supervisor::Supervisor;
use worker_common::alerter::FailureAlerter;
use worker_common::broker::InMemoryBroker;
use worker_common::health::HealthRegistry;
use worker_common::monitoring::{self, DashboardAuth};
use worker_common::objectstore::{ObjectStore, ObjectStoreConfig};
use worker_common::retry::{ChatClient, RetryConfig, RetryingClient};
use worker_common::status::{ControlPlaneClient, StatusReporter};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_with_defaults().expect("invalid configuration");
    let config = Arc::new(config);

    let retrying = RetryingClient::new(RetryConfig {
        max_retries: config.openrouter_max_retries,
        timeout: config.openrouter_timeout(),
        backoff_base: std::time::Duration::from_millis(config.openrouter_backoff_base_ms),
        backoff_jitter: std::time::Duration::from_millis(config.openrouter_backoff_jitter_ms),
    });
    let chat = ChatClient::new(
        retrying,
        config.openrouter_base_url.clone(),
        config.openrouter_api_key.clone(),
        config.openrouter_model.clone(),
    );

    let object_store = ObjectStore::new(ObjectStoreConfig {
        endpoint: config.s3_endpoint.clone(),
        region: config.aws_region.clone(),
        access_key: config.s3_key.clone(),
        secret_key: config.s3_secret.clone(),
        bucket: config.s3_bucket.clone(),
    })
    .await;

    let status = StatusReporter::new(ControlPlaneClient::new(config.api_base_url.clone()));

    let mut comfy_config = ComfyClientConfig::new(config.comfyui_api_url.clone(), config.comfyui_client_id.clone());
    comfy_config.poll_interval = config.comfyui_poll_interval();
    comfy_config.max_poll_attempts = config.comfyui_max_poll_attempts;
    let comfy = Arc::new(ComfyClient::new(comfy_config));

    let video_base_workflow = Arc::new(match &config.comfyui_video_workflow_json {
        Some(raw) => serde_json::from_str::<ComfyWorkflow>(raw).expect("COMFYUI_VIDEO_WORKFLOW_JSON must be a valid workflow"),
        None => ComfyWorkflow::new(),
    });

    let ctx = ProcessorContext {
        status,
        object_store,
        chat,
        comfy,
        config: config.clone(),
        video_base_workflow,
    };

    let broker = InMemoryBroker::new();
    let alerter = Arc::new(FailureAlerter::new(config.alert_webhook_url.clone(), config.alert_failure_threshold));
    let liveness = HealthRegistry::new("liveness");

    let recorder = monitoring::setup_metrics_recorder();
    let auth = match (&config.bull_board_user, &config.bull_board_password) {
        (Some(user), Some(password)) => Some(DashboardAuth {
            user: user.clone(),
            password: password.clone(),
        }),
        _ => None,
    };
    let monitoring_router = monitoring::router(recorder, broker.clone(), config.metrics_prefix.clone(), auth);

    let liveness_for_route = liveness.clone();
    let health_router = Router::new().route("/_liveness", get(move || ready(liveness_for_route.get_status())));
    let router = monitoring_router.merge(health_router);

    let supervisor = Supervisor::new(
        broker,
        ctx,
        alerter,
        liveness,
        config.max_concurrent_jobs_per_queue,
        config.image_generation_enabled,
    );
    supervisor.run(router, config.bull_board_bind()).await;

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutdown signal received"),
        Err(err) => tracing::error!(error = %err, "failed to listen for shutdown signal"),
    }
}
