//! HTTP ingestion endpoint for push-based sources.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/ingest/logs` | Submit a batch of raw lines ([`IngestBatch`]) |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! All error responses share one shape:
//!
//! ```json
//! { "error": { "code": "not_found", "message": "unknown website: shop" } }
//! ```
//!
//! Error codes: `bad_request` (400), `unauthorized` (401), `not_found` (404),
//! `ingest_failed` (500).
//!
//! When `[server].access_key` is set, every push must carry it in the
//! `X-Logscan-Key` header.

use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::push::{IngestBatch, IngestResult, PushIngestor};

pub const ACCESS_KEY_HEADER: &str = "x-logscan-key";

/// Shared state for the route handlers.
#[derive(Clone)]
pub struct AppState {
    websites: Arc<HashSet<String>>,
    access_key: Option<Arc<str>>,
    ingestor: Arc<PushIngestor>,
}

impl AppState {
    pub fn new(config: &Config, ingestor: Arc<PushIngestor>) -> Self {
        Self {
            websites: Arc::new(config.websites.iter().map(|w| w.id.clone()).collect()),
            access_key: config
                .server
                .access_key
                .as_deref()
                .filter(|k| !k.is_empty())
                .map(Arc::from),
            ingestor,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/ingest/logs", post(handle_ingest))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `[server].bind` and serve until the process is terminated.
pub async fn run_server(config: &Config, ingestor: Arc<PushIngestor>) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let app = router(AppState::new(config, ingestor));

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(bind = %bind_addr, "ingest server listening");
    println!("Ingest server listening on http://{}", bind_addr);

    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn unauthorized(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::NOT_FOUND, "not_found", message)
}

fn ingest_failed(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "ingest_failed", message)
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /api/ingest/logs ============

/// Checks the access key, validates ids, then hands the batch to the
/// [`PushIngestor`].
async fn handle_ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<IngestBatch>, JsonRejection>,
) -> Result<Json<IngestResult>, AppError> {
    if let Some(expected) = &state.access_key {
        let provided = headers
            .get(ACCESS_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != expected.as_ref() {
            return Err(unauthorized("missing or invalid access key"));
        }
    }

    let Json(batch) = body.map_err(|e| bad_request(e.body_text()))?;
    if batch.website_id.trim().is_empty() || batch.source_id.trim().is_empty() {
        return Err(bad_request("website_id and source_id must not be empty"));
    }
    if !state.websites.contains(&batch.website_id) {
        return Err(not_found(format!("unknown website: {}", batch.website_id)));
    }

    let result = state
        .ingestor
        .ingest(&batch)
        .await
        .map_err(|e| ingest_failed(format!("{:#}", e)))?;
    Ok(Json(result))
}
