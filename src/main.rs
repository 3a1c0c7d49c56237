//! Batch OCR server - resolves images and PDFs and runs them through an OCR engine.

mod batch;
mod config;
mod error;
mod ocr;
mod pdf;
mod router;
mod schema;
mod source;
#[cfg(test)]
mod testing;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use batch::BatchCoordinator;
use config::ServiceConfig;
use error::BatchError;
use ocr::vllm::VllmEngine;
use pdf::LopdfSplitter;
use router::DocumentRouter;
use schema::DocumentResult;
use serde_json::{json, Value};
use source::{HttpFetcher, SourceResolver};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    coordinator: Arc<BatchCoordinator>,
    config: Arc<ServiceConfig>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "batch_ocr=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServiceConfig::load()?;
    info!(
        "OCR engine: {} (model={}, max_concurrency={}, pdf_success_policy={:?})",
        config.engine_url, config.model, config.max_concurrency, config.pdf_success_policy
    );

    // Engine calls can run for minutes, so only fetches get a client timeout
    let engine = Arc::new(VllmEngine::new(reqwest::Client::new(), &config));
    let fetcher = Arc::new(HttpFetcher::new(Duration::from_secs(config.fetch_timeout_secs))?);

    let coordinator = BatchCoordinator::new(
        SourceResolver::new(fetcher, config.max_concurrent_fetches),
        DocumentRouter::new(
            engine,
            Arc::new(LopdfSplitter),
            config.max_concurrency,
            config.pdf_success_policy,
        ),
    );

    let body_limit = config
        .body_limit_bytes()
        .context("body_limit_mb is too large")?;
    let bind_addr = config.bind_addr.clone();
    let state = AppState {
        coordinator: Arc::new(coordinator),
        config: Arc::new(config),
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/run", post(run_job))
        .route("/runsync", post(run_job))
        .route("/ocr/image", post(ocr_image))
        .route("/ocr/pdf", post(ocr_pdf))
        .route("/ocr/batch", post(ocr_batch))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Server listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "engine": state.coordinator.router().engine_name(),
        "model": state.config.model,
        "max_concurrency": state.config.max_concurrency,
    }))
}

/// Serverless job entry point: `{"input": {"inputs": [...]}}` -> `{"output": [...]}`.
async fn run_job(State(state): State<AppState>, body: Bytes) -> (StatusCode, Json<Value>) {
    let items = match schema::parse_batch_event(&body) {
        Ok(items) => items,
        Err(e) => {
            error!("Rejected job: {}", e);
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() })));
        }
    };

    let batch = state.coordinator.process_batch(items);
    match with_batch_timeout(state.config.batch_timeout_secs, batch).await {
        Ok(results) => (StatusCode::OK, Json(json!({ "output": results }))),
        Err(e) => {
            error!("Job failed: {}", e);
            (StatusCode::GATEWAY_TIMEOUT, Json(json!({ "error": e.to_string() })))
        }
    }
}

/// OCR a single uploaded image.
async fn ocr_image(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<DocumentResult>, (StatusCode, String)> {
    let (upload, prompt) = single_upload(multipart).await?;
    info!("Image upload: {} ({} bytes)", upload.filename, upload.data.len());

    let result = state
        .coordinator
        .router()
        .handle_image(&upload.data, prompt.as_deref())
        .await;
    Ok(Json(result))
}

/// OCR every page of an uploaded PDF.
async fn ocr_pdf(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<DocumentResult>, (StatusCode, String)> {
    let (upload, prompt) = single_upload(multipart).await?;
    info!("PDF upload: {} ({} bytes)", upload.filename, upload.data.len());

    let result = state
        .coordinator
        .router()
        .handle_pdf(upload.data, prompt.as_deref(), &upload.filename)
        .await;
    Ok(Json(result))
}

/// OCR several uploads with a shared prompt; kinds are inferred per file.
async fn ocr_batch(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<Value>, (StatusCode, String)> {
    let (uploads, prompt) = read_uploads(multipart).await?;
    if uploads.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "No file uploaded".to_string()));
    }
    info!("Batch upload: {} files", uploads.len());

    let router = state.coordinator.router();
    let prompt = prompt.as_deref();
    let batch = futures::future::join_all(uploads.into_iter().map(|upload| async move {
        let result = router
            .route_upload(&upload.filename, upload.data, prompt)
            .await;
        json!({ "filename": upload.filename, "result": result })
    }));

    let results = with_batch_timeout(state.config.batch_timeout_secs, batch)
        .await
        .map_err(|e| (StatusCode::GATEWAY_TIMEOUT, e.to_string()))?;
    Ok(Json(json!({ "success": true, "results": results })))
}

// ============================================================================
// Helper functions
// ============================================================================

struct Upload {
    filename: String,
    data: Vec<u8>,
}

/// Collect every `file` field and the optional `prompt` field.
async fn read_uploads(
    mut multipart: Multipart,
) -> Result<(Vec<Upload>, Option<String>), (StatusCode, String)> {
    let mut uploads = Vec::new();
    let mut prompt = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        (StatusCode::BAD_REQUEST, format!("Multipart error: {}", e))
    })? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") | Some("files") => {
                let filename = field.file_name().unwrap_or("document").to_string();
                let data = field.bytes().await.map_err(|e| {
                    (StatusCode::BAD_REQUEST, format!("Failed to read file: {}", e))
                })?;
                uploads.push(Upload {
                    filename,
                    data: data.to_vec(),
                });
            }
            Some("prompt") => {
                let text = field.text().await.map_err(|e| {
                    (StatusCode::BAD_REQUEST, format!("Failed to read prompt: {}", e))
                })?;
                prompt = Some(text).filter(|p| !p.trim().is_empty());
            }
            _ => {}
        }
    }

    Ok((uploads, prompt))
}

async fn single_upload(
    multipart: Multipart,
) -> Result<(Upload, Option<String>), (StatusCode, String)> {
    let (uploads, prompt) = read_uploads(multipart).await?;
    let upload = uploads
        .into_iter()
        .next()
        .filter(|u| !u.data.is_empty())
        .ok_or_else(|| (StatusCode::BAD_REQUEST, "No file uploaded".to_string()))?;
    Ok((upload, prompt))
}

/// Run a whole batch under the configured deadline; on expiry in-flight work is dropped.
async fn with_batch_timeout<F: Future>(
    timeout_secs: Option<u64>,
    batch: F,
) -> Result<F::Output, BatchError> {
    match timeout_secs {
        Some(secs) => tokio::time::timeout(Duration::from_secs(secs), batch)
            .await
            .map_err(|_| BatchError::TimedOut(secs)),
        None => Ok(batch.await),
    }
}
