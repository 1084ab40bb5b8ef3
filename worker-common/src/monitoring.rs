//! Monitoring endpoint: Prometheus metrics plus a queue dashboard,
//! optionally protected by HTTP Basic auth.
//!
//! Follows the `setup_metrics_router`/`track_metrics` pattern from
//! `hook_common::metrics`, extended with per-queue gauges and a duration
//! histogram fed from the broker's outcome stream.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use base64::Engine;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::broker::{Broker, JobStatusEvent};
use crate::job::QueueName;

const EXPONENTIAL_SECONDS: &[f64] = &[
    0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0,
];

pub fn setup_metrics_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)
        .expect("fixed bucket list is always valid")
        .install_recorder()
        .expect("a single global recorder may be installed once per process")
}

#[derive(Clone)]
pub struct DashboardAuth {
    pub user: String,
    pub password: String,
}

#[derive(Clone)]
struct MonitoringState {
    recorder: PrometheusHandle,
    broker: Arc<dyn Broker>,
    metric_prefix: String,
    auth: Option<DashboardAuth>,
}

/// Build the `/metrics` and `/bull-board` routes. Queue gauges are collected
/// on scrape by calling the broker; the duration histogram is observed from
/// completion events via a background task.
pub fn router(
    recorder: PrometheusHandle,
    broker: Arc<dyn Broker>,
    metric_prefix: String,
    auth: Option<DashboardAuth>,
) -> Router {
    spawn_duration_observer(broker.clone(), metric_prefix.clone());

    let state = MonitoringState {
        recorder,
        broker,
        metric_prefix,
        auth,
    };

    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/bull-board", get(dashboard_handler))
        .layer(axum::middleware::from_fn(track_http_metrics))
        .with_state(state)
}

async fn metrics_handler(State(state): State<MonitoringState>) -> impl IntoResponse {
    for queue in [
        QueueName::ContentGeneration,
        QueueName::LoraTraining,
        QueueName::VideoGeneration,
        QueueName::ImageGeneration,
    ] {
        if let Ok(depth) = state.broker.queue_depth(queue).await {
            metrics::gauge!(
                format!("{}queue_jobs_waiting", state.metric_prefix),
                "queue" => queue.as_str()
            )
            .set(depth.waiting as f64);
            metrics::gauge!(
                format!("{}queue_jobs_failed", state.metric_prefix),
                "queue" => queue.as_str()
            )
            .set(depth.failed as f64);
        }
    }

    state.recorder.render()
}

async fn dashboard_handler(
    State(state): State<MonitoringState>,
    request: Request,
) -> Response {
    if let Some(auth) = &state.auth {
        if !is_authorized(&request, auth) {
            return (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Basic realm=\"bull-board\"")],
                "unauthorized",
            )
                .into_response();
        }
    }

    let mut rows = String::new();
    for queue in [
        QueueName::ContentGeneration,
        QueueName::LoraTraining,
        QueueName::VideoGeneration,
        QueueName::ImageGeneration,
    ] {
        if let Ok(depth) = state.broker.queue_depth(queue).await {
            rows.push_str(&format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td></tr>",
                queue.as_str(),
                depth.waiting,
                depth.failed
            ));
        }
    }

    let body = format!(
        "<html><body><h1>Queues</h1><table><tr><th>Queue</th><th>Waiting</th><th>Failed</th></tr>{}</table></body></html>",
        rows
    );

    Html(body).into_response()
}

fn is_authorized(request: &Request, auth: &DashboardAuth) -> bool {
    let Some(header_value) = request.headers().get(header::AUTHORIZATION) else {
        return false;
    };
    let Ok(header_str) = header_value.to_str() else {
        return false;
    };
    let Some(encoded) = header_str.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((user, password)) = decoded.split_once(':') else {
        return false;
    };

    user == auth.user && password == auth.password
}

async fn track_http_metrics(req: Request, next: Next) -> impl IntoResponse {
    let start = Instant::now();
    let path = req.uri().path().to_owned();
    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];
    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}

/// Observe completion durations (`finished_at - processed_at`) from the
/// broker's outcome stream into a per-queue histogram.
fn spawn_duration_observer(broker: Arc<dyn Broker>, metric_prefix: String) {
    let mut outcomes = broker.subscribe_outcomes();
    tokio::spawn(async move {
        loop {
            match outcomes.recv().await {
                Ok(event) => {
                    if let (Some(processed), Some(finished)) = (event.processed_at, event.finished_at) {
                        let seconds = (finished - processed).num_milliseconds() as f64 / 1000.0;
                        metrics::histogram!(
                            format!("{}job_duration_seconds", metric_prefix),
                            "queue" => event.queue.as_str()
                        )
                        .record(seconds.max(0.0));
                    }
                    if event.status == JobStatusEvent::Failed {
                        metrics::counter!(
                            format!("{}queue_failures_total", metric_prefix),
                            "queue" => event.queue.as_str()
                        )
                        .increment(1);
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, router).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;

    fn header_auth(user: &str, password: &str) -> String {
        let raw = format!("{}:{}", user, password);
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(raw)
        )
    }

    #[test]
    fn rejects_missing_credentials() {
        let request = HttpRequest::builder().body(Body::empty()).unwrap();
        let auth = DashboardAuth {
            user: "admin".into(),
            password: "secret".into(),
        };
        assert!(!is_authorized(&request, &auth));
    }

    #[test]
    fn accepts_matching_credentials() {
        let request = HttpRequest::builder()
            .header(header::AUTHORIZATION, header_auth("admin", "secret"))
            .body(Body::empty())
            .unwrap();
        let auth = DashboardAuth {
            user: "admin".into(),
            password: "secret".into(),
        };
        assert!(is_authorized(&request, &auth));
    }

    #[test]
    fn rejects_mismatched_password() {
        let request = HttpRequest::builder()
            .header(header::AUTHORIZATION, header_auth("admin", "wrong"))
            .body(Body::empty())
            .unwrap();
        let auth = DashboardAuth {
            user: "admin".into(),
            password: "secret".into(),
        };
        assert!(!is_authorized(&request, &auth));
    }
}
