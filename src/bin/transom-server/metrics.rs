use std::sync::OnceLock;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::Request;
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use prometheus::{
    Encoder, Gauge, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts as PromOpts,
    Registry, TextEncoder,
};

struct Metrics {
    registry: Registry,
    http_requests_total: IntCounterVec,
    http_request_duration_seconds: HistogramVec,
    http_in_flight_requests: IntGauge,
    queue_depth: IntGauge,
    tasks_total: IntCounterVec,
    stress_memory_bytes: Gauge,
    stress_disk_bytes: Gauge,
    stress_cpu_percent: Gauge,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn build_metrics() -> Result<Metrics> {
    let registry = Registry::new();

    let http_requests_total = IntCounterVec::new(
        PromOpts::new(
            "transom_http_requests_total",
            "Total HTTP requests served by transom-server.",
        ),
        &["status"],
    )
    .context("invalid definition for transom_http_requests_total")?;

    let http_request_duration_seconds = HistogramVec::new(
        HistogramOpts::new(
            "transom_http_request_duration_seconds",
            "HTTP request latency in seconds.",
        ),
        &["status"],
    )
    .context("invalid definition for transom_http_request_duration_seconds")?;

    let http_in_flight_requests = IntGauge::new(
        "transom_http_in_flight_requests",
        "Current number of in-flight HTTP requests.",
    )
    .context("invalid definition for transom_http_in_flight_requests")?;

    let queue_depth = IntGauge::new(
        "transom_queue_depth",
        "Tasks waiting in the pipeline queue.",
    )
    .context("invalid definition for transom_queue_depth")?;

    let tasks_total = IntCounterVec::new(
        PromOpts::new(
            "transom_tasks_total",
            "Tasks reaching a terminal status, by status.",
        ),
        &["status"],
    )
    .context("invalid definition for transom_tasks_total")?;

    let stress_memory_bytes = Gauge::new(
        "transom_stress_memory_bytes",
        "Bytes held by the synthetic memory load.",
    )
    .context("invalid definition for transom_stress_memory_bytes")?;

    let stress_disk_bytes = Gauge::new(
        "transom_stress_disk_bytes",
        "Bytes written by the synthetic disk load.",
    )
    .context("invalid definition for transom_stress_disk_bytes")?;

    let stress_cpu_percent = Gauge::new(
        "transom_stress_cpu_percent",
        "Target load of the synthetic CPU stressor.",
    )
    .context("invalid definition for transom_stress_cpu_percent")?;

    registry
        .register(Box::new(http_requests_total.clone()))
        .context("failed to register transom_http_requests_total")?;
    registry
        .register(Box::new(http_request_duration_seconds.clone()))
        .context("failed to register transom_http_request_duration_seconds")?;
    registry
        .register(Box::new(http_in_flight_requests.clone()))
        .context("failed to register transom_http_in_flight_requests")?;
    registry
        .register(Box::new(queue_depth.clone()))
        .context("failed to register transom_queue_depth")?;
    registry
        .register(Box::new(tasks_total.clone()))
        .context("failed to register transom_tasks_total")?;
    registry
        .register(Box::new(stress_memory_bytes.clone()))
        .context("failed to register transom_stress_memory_bytes")?;
    registry
        .register(Box::new(stress_disk_bytes.clone()))
        .context("failed to register transom_stress_disk_bytes")?;
    registry
        .register(Box::new(stress_cpu_percent.clone()))
        .context("failed to register transom_stress_cpu_percent")?;

    Ok(Metrics {
        registry,
        http_requests_total,
        http_request_duration_seconds,
        http_in_flight_requests,
        queue_depth,
        tasks_total,
        stress_memory_bytes,
        stress_disk_bytes,
        stress_cpu_percent,
    })
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

pub fn init() -> Result<()> {
    if metrics().is_some() {
        return Ok(());
    }

    let built = build_metrics()?;
    let _ = METRICS.set(built);
    Ok(())
}

pub fn observe_queue_depth(depth: usize) {
    if let Some(metrics) = metrics() {
        metrics.queue_depth.set(depth as i64);
    }
}

pub fn observe_task_terminal(status: &str) {
    if let Some(metrics) = metrics() {
        metrics.tasks_total.with_label_values(&[status]).inc();
    }
}

pub fn set_stress_memory(bytes: f64) {
    if let Some(metrics) = metrics() {
        metrics.stress_memory_bytes.set(bytes);
    }
}

pub fn set_stress_disk(bytes: f64) {
    if let Some(metrics) = metrics() {
        metrics.stress_disk_bytes.set(bytes);
    }
}

pub fn set_stress_cpu(percent: f64) {
    if let Some(metrics) = metrics() {
        metrics.stress_cpu_percent.set(percent);
    }
}

pub async fn prometheus_metrics() -> Response {
    if metrics().is_none()
        && let Err(err) = init()
    {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to initialize metrics: {err:#}"),
        )
            .into_response();
    }

    let Some(metrics) = metrics() else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "metrics not initialized").into_response();
    };

    let families = metrics.registry.gather();
    let mut buf = Vec::new();
    if TextEncoder::new().encode(&families, &mut buf).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to encode metrics",
        )
            .into_response();
    }

    (
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
        )],
        buf,
    )
        .into_response()
}

pub async fn track_http_metrics(req: Request<Body>, next: Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str())
        .unwrap_or_else(|| req.uri().path())
        .to_owned();

    if route == "/metrics" || route == "/" {
        return next.run(req).await;
    }

    let Some(metrics) = metrics() else {
        return next.run(req).await;
    };

    let start = Instant::now();

    metrics.http_in_flight_requests.inc();
    let response = next.run(req).await;
    metrics.http_in_flight_requests.dec();

    let status = response.status().as_u16().to_string();
    metrics
        .http_requests_total
        .with_label_values(&[&status])
        .inc();
    metrics
        .http_request_duration_seconds
        .with_label_values(&[&status])
        .observe(start.elapsed().as_secs_f64());

    response
}
