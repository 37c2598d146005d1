use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use faceprint_core::{BatchEmbedding, ImageFailure, PipelineError};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tower_http::trace::TraceLayer;

use crate::engine::{EngineError, EngineHandle};

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: EngineHandle,
    pub request_timeout: Duration,
    pub localization: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct EmbeddingRequest {
    pub images: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct EmbeddingResponse {
    pub embedding: Vec<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<ImageFailure>,
}

impl From<BatchEmbedding> for EmbeddingResponse {
    fn from(batch: BatchEmbedding) -> Self {
        Self {
            embedding: batch.embedding,
            failed: batch.failures,
        }
    }
}

/// Error body: `{"error": {"kind": ..., "message": ...}}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn timeout() -> Self {
        Self {
            status: StatusCode::GATEWAY_TIMEOUT,
            kind: "timeout",
            message: "request timed out".into(),
        }
    }

    fn internal(kind: &'static str) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind,
            message: "internal error".into(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: rejection.status(),
            kind: "invalid_request",
            message: rejection.body_text(),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Pipeline(err) => err.into(),
            other => {
                tracing::error!(error = %other, "engine unavailable");
                Self::internal("internal_error")
            }
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        if err.is_client_fault() {
            return Self {
                status: StatusCode::UNPROCESSABLE_ENTITY,
                kind: err.kind(),
                message: err.to_string(),
            };
        }
        if matches!(err, PipelineError::Timeout { .. }) {
            return Self::timeout();
        }
        // Model details stay in the log.
        tracing::error!(kind = err.kind(), error = %err, "embedding failed");
        Self::internal(err.kind())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": { "kind": self.kind, "message": self.message }
        });
        (self.status, Json(body)).into_response()
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/generate-embedding", post(generate_embedding))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn generate_embedding(
    State(state): State<AppState>,
    request: Result<Json<EmbeddingRequest>, JsonRejection>,
) -> Result<Json<EmbeddingResponse>, ApiError> {
    let Json(request) = request?;
    let count = request.images.len();
    tracing::info!(images = count, "generate-embedding requested");

    let deadline = Instant::now() + state.request_timeout;
    let embed = state.engine.embed(request.images, deadline);
    let batch = tokio::time::timeout_at(deadline.into(), embed)
        .await
        .map_err(|_| {
            tracing::warn!(images = count, "generate-embedding timed out");
            ApiError::timeout()
        })??;

    tracing::info!(
        images = count,
        contributing = batch.contributing,
        dim = batch.embedding.len(),
        "generate-embedding done"
    );
    Ok(Json(batch.into()))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "localization": state.localization,
    }))
}
