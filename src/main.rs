// Main entry point for the landmark photo preprocessing workflow

use landmark_workflow::{
    core::{errors::JobError, types::*, ArchiveError, Config, InferenceError, PipelineError},
    orchestration::BatchOrchestrator,
    utils::Metrics,
};

use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{Html, IntoResponse, Json},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::{error, info, warn};

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<BatchOrchestrator>,
    metrics: Metrics,
}

const INDEX_HTML: &str = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>Landmark Workflow</title></head>
<body>
  <h1>Preprocess a ZIP of photographs</h1>
  <form action="/upload" method="post" enctype="multipart/form-data">
    <input type="file" name="file" accept=".zip">
    <input type="submit" value="Upload">
  </form>
  <h1>Tokyo Tower or Tokyo Skytree?</h1>
  <form action="/predict" method="post" enctype="multipart/form-data">
    <input type="file" name="file" accept="image/*">
    <input type="submit" value="Predict">
  </form>
</body>
</html>
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Arc::new(Config::new().context("Failed to load configuration")?);

    // Initialize logging
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::new(format!(
        "landmark_workflow={},ort=off",
        match config.log_level() {
            tracing::Level::TRACE => "trace",
            tracing::Level::DEBUG => "debug",
            tracing::Level::INFO => "info",
            tracing::Level::WARN => "warn",
            tracing::Level::ERROR => "error",
        }
    ));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("=== LANDMARK PHOTO WORKFLOW ===");
    info!(
        "Config: target={}x{} augment={} (p={}) remove_bg={} jobs={} upload_limit={}MB",
        config.output.target_width,
        config.output.target_height,
        if config.augment.enabled { "ON" } else { "OFF" },
        config.augment.probability,
        if config.background.enabled { "ON" } else { "OFF" },
        config.max_concurrent_jobs(),
        config.server.max_upload_mb
    );

    // Initialize metrics
    let metrics = Metrics::new();

    // Initialize batch orchestrator
    info!("Initializing batch orchestrator...");
    let orchestrator = Arc::new(BatchOrchestrator::new(config.clone(), metrics.clone()).await?);
    let state = AppState {
        orchestrator,
        metrics,
    };

    // Setup CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/stats", get(stats_endpoint))
        .route("/upload", post(upload_archive))
        .route("/predict", post(predict_image))
        .nest_service("/processed", ServeDir::new(config.processed_dir()))
        .with_state(state)
        .layer(DefaultBodyLimit::max(config.max_upload_bytes()))
        .layer(cors);

    let addr = format!("{}:{}", config.server_host(), config.server_port());
    info!("{}", "=".repeat(70));
    info!("Server starting on http://{}", addr);
    info!("{}", "-".repeat(70));
    info!("Endpoints:");
    info!("  GET  /                       - Upload forms");
    info!("  GET  /health                 - Health check");
    info!("  GET  /metrics                - Prometheus metrics");
    info!("  GET  /stats                  - Detailed statistics");
    info!("  POST /upload                 - Preprocess a ZIP (multipart/form-data)");
    info!("  POST /predict                - Classify one photo (multipart/form-data)");
    info!("  GET  /processed/{{job}}/{{file}} - Processed outputs");
    info!("{}", "=".repeat(70));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn root() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.metrics.record_endpoint_request("/health");
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "backend": state.orchestrator.backend_type(),
        "background_model": state.orchestrator.background_loaded(),
        "classifier_model": state.orchestrator.classifier_loaded(),
    }))
}

/// Prometheus metrics endpoint
async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        state.metrics.to_prometheus(),
    )
}

/// Detailed statistics endpoint (JSON)
async fn stats_endpoint(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let snapshot = state.metrics.snapshot();
    serde_json::to_value(snapshot).map(Json).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to serialize metrics: {}", e),
        )
    })
}

/// Uploaded file plus the optional JSON overrides
struct UploadForm {
    file: Option<(String, Vec<u8>)>,
    config: ProcessingConfig,
}

async fn read_form(mut multipart: Multipart) -> Result<UploadForm, (StatusCode, String)> {
    let mut form = UploadForm {
        file: None,
        config: ProcessingConfig::default(),
    };

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Multipart error: {}", e)))?
    {
        let name = field.name().unwrap_or("").to_string();

        match name.as_str() {
            "file" => {
                let filename = field.file_name().unwrap_or("").to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| (StatusCode::BAD_REQUEST, format!("Read error: {}", e)))?;
                form.file = Some((filename, data.to_vec()));
            }
            "config" => {
                let config_data = field
                    .text()
                    .await
                    .map_err(|e| (StatusCode::BAD_REQUEST, format!("Config read error: {}", e)))?;

                if !config_data.trim().is_empty() {
                    form.config = serde_json::from_str(&config_data).map_err(|e| {
                        (
                            StatusCode::BAD_REQUEST,
                            format!("Invalid config JSON: {}", e),
                        )
                    })?;
                }
            }
            _ => {}
        }
    }

    Ok(form)
}

fn require_file(form: &mut UploadForm) -> Result<(String, Vec<u8>), (StatusCode, String)> {
    let (filename, data) = form
        .file
        .take()
        .ok_or_else(|| (StatusCode::BAD_REQUEST, "No file part".to_string()))?;
    if filename.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "No file selected".to_string()));
    }
    Ok((filename, data))
}

/// Map job errors onto HTTP status codes
fn job_error_response(e: JobError) -> (StatusCode, String) {
    let status = match &e {
        JobError::Archive(ArchiveError::Io { .. }) => StatusCode::INTERNAL_SERVER_ERROR,
        JobError::Archive(_) => StatusCode::BAD_REQUEST,
        JobError::Inference(InferenceError::ModelUnavailable { .. }) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        JobError::Pipeline(PipelineError::DecodeFailed { .. }) => StatusCode::BAD_REQUEST,
        JobError::QueueClosed => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status.is_server_error() {
        error!("Request failed: {:?}", e);
    } else {
        warn!("Request rejected: {}", e);
    }
    (status, e.to_string())
}

/// Preprocess a ZIP of photographs
///
/// # Request Format:
/// - multipart/form-data
/// - Field "file": ZIP archive of images
/// - Field "config" (optional): JSON `ProcessingConfig`; `{"cutout": true}`
///   returns colour RGBA cutouts instead of 90x160 grayscale outputs
///
/// # Response:
/// - BatchResult JSON with per-file results and analytics
async fn upload_archive(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<BatchResult>, (StatusCode, String)> {
    let start_time = std::time::Instant::now();
    state.metrics.record_endpoint_request("/upload");
    info!("Received upload request");

    let mut form = read_form(multipart).await?;
    let (filename, data) = require_file(&mut form)?;

    let result = state
        .orchestrator
        .process_archive(data, &filename, &form.config)
        .await
        .map_err(job_error_response)?;

    info!(
        "Request completed in {:.2}s: {} successful, {} failed",
        start_time.elapsed().as_secs_f64(),
        result.successful,
        result.failed
    );

    Ok(Json(result))
}

/// Classify one photograph as Tokyo Tower or Tokyo Skytree
async fn predict_image(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<Prediction>, (StatusCode, String)> {
    state.metrics.record_endpoint_request("/predict");
    info!("Received predict request");

    let mut form = read_form(multipart).await?;
    let (filename, data) = require_file(&mut form)?;

    let prediction = state
        .orchestrator
        .process_single(data, &filename)
        .await
        .map_err(job_error_response)?;

    Ok(Json(prediction))
}
