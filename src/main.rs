mod config;
mod generation;
mod http;
mod idempotency;
mod jobs;
mod llm;
mod metrics;
mod models;
mod pipeline;
mod storage;
mod studio;
#[cfg(test)]
mod testing;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use config::AppConfig;
use eyre::WrapErr;
use idempotency::IdempotencyStore;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{
    ApiError, BlankProductRequest, BlankProductResponse, CompositeLogoRequest,
    CompositeLogoResponse, PipelineRunRequest, PipelineRunResponse, RemoveBackgroundRequest,
    RemoveBackgroundResponse, StyleAnalysisRequest, StyleAnalysisResponse,
};
use pipeline::{Pipeline, PipelineError, PipelineErrorKind};
use serde::Serialize;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use storage::{BlobSink, MemoryBlobSink, SupabaseStorage};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "studio.api", "server crashed: {err:?}");
    }
}

async fn run() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env();
    let (sink, blobs): (Arc<dyn BlobSink>, Option<MemoryBlobSink>) =
        match SupabaseStorage::from_config(&config.storage, config.connect_timeout) {
            Some(supabase) => {
                info!(target = "studio.storage", bucket = %config.storage.bucket, "blob_sink_supabase");
                (Arc::new(supabase), None)
            }
            None => {
                warn!(
                    target = "studio.storage",
                    "SUPABASE_URL not configured; generated images are kept in memory"
                );
                let memory =
                    MemoryBlobSink::new(&config.public_base_url, &config.storage.namespace);
                (Arc::new(memory.clone()), Some(memory))
            }
        };

    let pipeline = Pipeline::from_config(&config, sink);
    let (queue, _worker) = jobs::JobQueue::spawn(pipeline.clone(), &config.jobs);
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("installing prometheus recorder")?;

    let state = AppState {
        pipeline,
        queue,
        openapi: Arc::new(load_openapi()),
        idempotency: IdempotencyStore::new(
            config.redis_url.as_deref(),
            config.idempotency_ttl_secs,
        ),
        prometheus_handle,
        blobs,
        metrics_key: config.metrics_key.clone(),
        openapi_key: config.openapi_key.clone(),
    };
    let app = router(state, config.body_limit);

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    info!(target = "studio.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("binding {addr}"))?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    pipeline: Pipeline,
    queue: jobs::JobQueue,
    openapi: Arc<serde_json::Value>,
    idempotency: IdempotencyStore,
    prometheus_handle: PrometheusHandle,
    /// Present when generated images live in process memory.
    blobs: Option<MemoryBlobSink>,
    metrics_key: Option<String>,
    openapi_key: Option<String>,
}

fn router(state: AppState, body_limit: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .nest(
            "/stages",
            Router::new()
                .route("/analyze_style", post(stage_analyze_style))
                .route("/blank_product", post(stage_blank_product))
                .route("/composite_logo", post(stage_composite_logo))
                .route("/remove_background", post(stage_remove_background)),
        )
        .route("/pipeline/runs", post(create_pipeline_run))
        .nest(
            "/jobs",
            Router::new()
                .route("/runs", post(enqueue_run_job))
                .route("/{id}", get(get_job_status)),
        )
        .route("/blobs/{*key}", get(get_blob))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit))
}

fn load_openapi() -> serde_json::Value {
    serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
        .unwrap_or_else(|_| json!({"openapi": "3.0.3"}))
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
///
/// Returns a small JSON payload with `status` and `service`.
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "studio-api-rs",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Some(key) = &state.openapi_key
        && presented(&headers, "X-Docs-Key") != key
    {
        return Err(AppError::Unauthorized);
    }
    Ok(Json((*state.openapi).clone()))
}

async fn swagger_ui() -> impl IntoResponse {
    let html = r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Studio API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#;
    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], html)
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(secret) = &state.metrics_key
        && presented(&headers, "X-Metrics-Key") != secret
    {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

fn presented<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// Describe the photography style from free text or a reference photo.
///
/// - Method: `POST`
/// - Path: `/stages/analyze_style`
/// - Body: `{styleInput?, referenceImageUrl?}`; with neither, a default studio style is returned
async fn stage_analyze_style(
    State(state): State<AppState>,
    Json(payload): Json<StyleAnalysisRequest>,
) -> Result<Json<StyleAnalysisResponse>, AppError> {
    metrics::inc_requests("/stages/analyze_style");
    info!(
        target = "studio.api",
        user_id = payload.user_id.as_deref().unwrap_or("anonymous"),
        has_text = payload.style_input.is_some(),
        has_reference = payload.reference_image_url.is_some(),
        "style analysis invoked"
    );
    let style = state.pipeline.analyze_style(&payload).await?;
    Ok(Json(StyleAnalysisResponse {
        success: true,
        style_description: style.into_inner(),
        timestamp: Utc::now(),
    }))
}

/// Re-shoot the garment as a clean blank product.
///
/// - Method: `POST`
/// - Path: `/stages/blank_product`
/// - Body: `{originalImageUrl, styleDescription, productDescription?, referenceImageUrl?}`
async fn stage_blank_product(
    State(state): State<AppState>,
    Json(payload): Json<BlankProductRequest>,
) -> Result<Json<BlankProductResponse>, AppError> {
    metrics::inc_requests("/stages/blank_product");
    info!(
        target = "studio.api",
        user_id = payload.user_id.as_deref().unwrap_or("anonymous"),
        "blank product invoked"
    );
    let blank = state.pipeline.create_blank_product(&payload).await?;
    Ok(Json(BlankProductResponse {
        success: true,
        blank_product_url: blank.image.into_url(),
        analysis: blank.analysis,
        timestamp: Utc::now(),
    }))
}

/// Place the logo on the blank product.
///
/// - Method: `POST`
/// - Path: `/stages/composite_logo`
/// - Body: `{blankProductUrl, logoImageUrl, outputSize?, referenceImageUrl?}`
///
/// `referenceImageUrl` drives garment/placement classification; any classifier
/// failure falls back to the center front.
async fn stage_composite_logo(
    State(state): State<AppState>,
    Json(payload): Json<CompositeLogoRequest>,
) -> Result<Json<CompositeLogoResponse>, AppError> {
    metrics::inc_requests("/stages/composite_logo");
    info!(
        target = "studio.api",
        user_id = payload.user_id.as_deref().unwrap_or("anonymous"),
        has_reference = payload.reference_image_url.is_some(),
        "logo compositing invoked"
    );
    let composited = state.pipeline.composite_logo(&payload).await?;
    Ok(Json(CompositeLogoResponse {
        success: true,
        final_image_url: composited.image.into_url(),
        analysis: composited.analysis,
        placement: composited.placement,
        timestamp: Utc::now(),
    }))
}

async fn stage_remove_background(
    State(state): State<AppState>,
    Json(payload): Json<RemoveBackgroundRequest>,
) -> Result<Json<RemoveBackgroundResponse>, AppError> {
    metrics::inc_requests("/stages/remove_background");
    let image = state.pipeline.remove_background(&payload.image_url).await?;
    Ok(Json(RemoveBackgroundResponse {
        success: true,
        image_url: image.into_url(),
        timestamp: Utc::now(),
    }))
}

/// Run every stage in order.
///
/// - Method: `POST`
/// - Path: `/pipeline/runs`
/// - Headers: optional `Idempotency-Key`; a completed run is replayed for the same key
/// - Response: `PipelineRunResponse` (URLs, placement, state transitions, per-stage transcript)
async fn create_pipeline_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<PipelineRunRequest>,
) -> Result<Json<PipelineRunResponse>, AppError> {
    metrics::inc_requests("/pipeline/runs");
    let key = Some(presented(&headers, "Idempotency-Key").trim())
        .filter(|key| !key.is_empty())
        .map(str::to_string);

    if let Some(key) = &key
        && let Some(existing) = state.idempotency.get(key).await
    {
        info!(target = "studio.api", run_id = %existing.run_id, "pipeline run replayed");
        return Ok(Json(existing));
    }

    let response = state.pipeline.run(payload).await?;
    if let Some(key) = key {
        state.idempotency.put(key, &response).await;
    }
    Ok(Json(response))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EnqueueResponse {
    success: bool,
    job_id: String,
}

async fn enqueue_run_job(
    State(state): State<AppState>,
    Json(payload): Json<PipelineRunRequest>,
) -> Result<(StatusCode, Json<EnqueueResponse>), AppError> {
    metrics::inc_requests("/jobs/runs");
    pipeline::stages::require_run_inputs(&payload)?;
    let id = state
        .queue
        .enqueue_run(payload)
        .await
        .map_err(|err| AppError::Unavailable(err.to_string()))?;
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            success: true,
            job_id: id.to_string(),
        }),
    ))
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
        return Err(AppError::BadRequest("invalid_job_id".into()));
    };
    state
        .queue
        .get(uuid)
        .await
        .map(Json)
        .ok_or(AppError::NotFound("job"))
}

async fn get_blob(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, AppError> {
    let Some(blobs) = &state.blobs else {
        return Err(AppError::NotFound("blob"));
    };
    let object = blobs.get(&key).await.ok_or(AppError::NotFound("blob"))?;
    Ok(([(header::CONTENT_TYPE, object.content_type)], object.bytes).into_response())
}

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
    BadRequest(String),
    NotFound(&'static str),
    Unauthorized,
    Unavailable(String),
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

fn status_for(kind: PipelineErrorKind) -> StatusCode {
    match kind {
        PipelineErrorKind::Validation => StatusCode::BAD_REQUEST,
        PipelineErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        PipelineErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        PipelineErrorKind::Storage | PipelineErrorKind::Unknown => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        PipelineErrorKind::AuthFailed
        | PipelineErrorKind::QuotaExceeded
        | PipelineErrorKind::EmptyModelResponse
        | PipelineErrorKind::UnrecognizedResponseShape
        | PipelineErrorKind::InvalidGeneratedUrl => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, payload) = match self {
            AppError::Pipeline(err) => {
                let status = status_for(err.kind());
                if status.is_server_error() {
                    error!(target = "studio.api", stage = err.stage(), kind = err.kind().as_str(), error = %err, "request failed");
                }
                let payload = ApiError {
                    stage: Some(err.stage().to_string()),
                    kind: Some(err.kind().as_str().to_string()),
                    ..ApiError::new(err.detail())
                };
                (status, payload)
            }
            AppError::BadRequest(message) => (StatusCode::BAD_REQUEST, ApiError::new(message)),
            AppError::NotFound(what) => {
                (StatusCode::NOT_FOUND, ApiError::new(format!("{what} not found")))
            }
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, ApiError::new("unauthorized")),
            AppError::Unavailable(message) => {
                (StatusCode::SERVICE_UNAVAILABLE, ApiError::new(message))
            }
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
