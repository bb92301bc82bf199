use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::from_fn;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::trace::{DefaultMakeSpan, DefaultOnFailure, DefaultOnResponse, TraceLayer};
use tracing::{Level, error, info, warn};

mod metrics;
mod stress;

use transom::config::Config;
use transom::media::{FfmpegTools, MediaTools};
use transom::pipeline::{SubmitError, WorkerPool};
use transom::progress;
use transom::ratelimit::RateLimiter;
use transom::registry::TaskRegistry;
use transom::store::{MemoryStore, ObjectStore, S3Store};
use transom::task::Task;

#[derive(Parser, Debug)]
#[command(name = "transom-server")]
#[command(about = "HTTP server for the media-transcription pipeline")]
struct Params {
    /// Host interface to bind to (overrides APP_HOST).
    #[arg(long = "host")]
    host: Option<String>,

    /// TCP port to listen on (overrides APP_PORT).
    #[arg(long = "port")]
    port: Option<u16>,
}

#[derive(Clone)]
struct AppState {
    pool: Arc<WorkerPool>,
    config: Arc<Config>,
}

#[derive(Debug, Deserialize)]
struct TaskRequest {
    url: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    detail: String,
}

struct AppError {
    status: StatusCode,
    detail: String,
}

impl AppError {
    fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: detail.into(),
        }
    }

    fn unprocessable(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            detail: detail.into(),
        }
    }

    fn internal(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: detail.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            detail: self.detail,
        });
        (self.status, body).into_response()
    }
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        // Logging is configured inside run(); a failure this early may predate
        // it, so report on stderr unconditionally.
        eprintln!("transom-server failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let params = Params::parse();

    let mut config = Config::from_env().context("invalid configuration")?;
    config.require_api_key().context("invalid configuration")?;
    if let Some(host) = params.host {
        config.app.host = host;
    }
    if let Some(port) = params.port {
        config.app.port = port;
    }
    transom::init_logging(&config.app);

    if let Err(err) = metrics::init() {
        warn!(error = ?err, "metrics disabled (init failed)");
    }
    let config = Arc::new(config);

    let addr: SocketAddr = format!("{}:{}", config.app.host, config.app.port)
        .parse()
        .context("invalid host/port bind address")?;

    let store: Arc<dyn ObjectStore> = if config.store.endpoint.trim().is_empty() {
        warn!("STORE_ENDPOINT not set; artifacts go to the in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(
            S3Store::connect(&config.store)
                .await
                .context("failed to connect to object store")?,
        )
    };

    let media: Arc<dyn MediaTools> =
        Arc::new(FfmpegTools::new(&config.download, &config.transcription));
    let registry = Arc::new(TaskRegistry::new());
    let limiter = Arc::new(RateLimiter::new(&config.rate_limit));
    let pool = WorkerPool::start(&config, registry, store, media, limiter);

    let state = AppState {
        pool: pool.clone(),
        config,
    };

    let app = Router::new()
        .route("/", get(root))
        .route("/metrics", get(metrics::prometheus_metrics))
        .route("/tasks", post(submit_task))
        .route("/process-url", post(process_url))
        .route_layer(from_fn(metrics::track_http_metrics))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(
                    DefaultMakeSpan::new()
                        .level(Level::INFO)
                        .include_headers(false),
                )
                .on_response(DefaultOnResponse::new().level(Level::INFO))
                .on_failure(DefaultOnFailure::new().level(Level::ERROR)),
        );

    let listener = TcpListener::bind(addr).await.context("bind failed")?;
    info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Drain queued and in-flight tasks before exiting.
    pool.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = ?err, "failed to install ctrl-c handler");
    } else {
        info!("shutdown signal received");
    }
}

async fn root(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "message": "transom pipeline service is running.",
        "environment": state.config.app.environment.as_str(),
        "debug": state.config.app.debug,
    }))
}

async fn submit_task(
    State(state): State<AppState>,
    Json(request): Json<TaskRequest>,
) -> std::result::Result<Response, AppError> {
    let url = request.url.trim().to_owned();
    if url.is_empty() {
        return Err(AppError::bad_request("URL must not be empty."));
    }

    let task = state.pool.submit(&url).map_err(|err| match err {
        SubmitError::Duplicate | SubmitError::QueueFull => {
            AppError::bad_request(format!("Failed to add task: {err}."))
        }
        SubmitError::ShuttingDown => AppError::internal(format!("Failed to add task: {err}.")),
    })?;
    metrics::observe_queue_depth(state.pool.queue_depth());

    let body = Body::from_stream(
        event_frames(task).map(Ok::<_, std::convert::Infallible>),
    );
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"))
        .header(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"))
        .header(header::CONNECTION, HeaderValue::from_static("keep-alive"))
        .header("X-Accel-Buffering", HeaderValue::from_static("no"))
        .body(body)
        .map_err(|err| AppError::internal(format!("building response: {err}")))
}

/// Frame the task's status stream as SSE records.
///
/// A framing failure appends an error to the task, emits one final record
/// carrying it, and ends the stream.
fn event_frames(task: Arc<Task>) -> impl futures_util::Stream<Item = Bytes> {
    progress::stream(task.clone()).scan(false, move |terminated, event| {
        if *terminated {
            return futures_util::future::ready(None);
        }
        if event.status.is_terminal() {
            metrics::observe_task_terminal(event.status.as_str());
        }

        let bytes = match progress::sse_frame(&event) {
            Ok(frame) => Bytes::from(frame),
            Err(err) => {
                error!(task_id = %task.id, error = %err, "status streaming error");
                task.add_error(format!("status streaming error: {err}"), None);
                *terminated = true;
                let fallback = serde_json::json!({
                    "id": task.id,
                    "status": event.status,
                    "progress": event.progress,
                    "error": format!("status streaming error: {err}"),
                });
                Bytes::from(format!("data: {fallback}\n\n"))
            }
        };
        futures_util::future::ready(Some(bytes))
    })
}

async fn process_url(
    State(state): State<AppState>,
    Query(stress_params): Query<stress::StressParams>,
    Json(request): Json<TaskRequest>,
) -> std::result::Result<Json<serde_json::Value>, AppError> {
    let url = request.url.trim().to_owned();
    if url.is_empty() {
        return Err(AppError::bad_request("URL must not be empty."));
    }
    stress_params.validate().map_err(AppError::unprocessable)?;

    stress::run(&stress_params)
        .await
        .map_err(|err| AppError::internal(format!("{err:#}")))?;

    Ok(Json(serde_json::json!({
        "message": format!("Processing URL: {url}"),
        "store_endpoint": state.config.store.endpoint,
        "stress_memory": stress_params.stress_memory,
        "stress_disk": stress_params.stress_disk,
        "stress_cpu": stress_params.stress_cpu,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_error_serializes_detail() {
        let resp = AppError::bad_request("URL must not be empty.").into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn event_frames_end_with_a_terminal_record() {
        use futures_util::StreamExt;
        use transom::task::TaskStatus;

        let task = Task::new("https://example/media/clip.mp4");
        assert!(task.try_transition(TaskStatus::Downloading));
        assert!(task.try_transition(TaskStatus::Failed));

        let frames: Vec<Bytes> = event_frames(task).collect().await;
        let last = String::from_utf8(frames.last().expect("at least one frame").to_vec())
            .expect("frame is utf-8");
        assert!(last.starts_with("data: "));
        assert!(last.contains("\"status\":\"failed\""));
        assert!(last.ends_with("\n\n"));
    }
}
