//! Health, readiness, and state endpoints
//!
//! Thin read-only surface over the runner's published `PipelineState` and
//! the sink's derived health. Scrape-format metrics are intentionally not
//! served here.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use logs2sentinel_sink::{HealthStatus, SentinelSink};
use parking_lot::RwLock;
use serde_json::json;

use crate::runner::PipelineState;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<RwLock<PipelineState>>,
    pub sink: Arc<SentinelSink>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/state", get(pipeline_state))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Response {
    let sink_health = state.sink.health();
    let status = match sink_health.status {
        HealthStatus::Healthy => "healthy",
        HealthStatus::Degraded => "degraded",
    };
    Json(json!({
        "status": status,
        "circuit_state": sink_health.circuit_state.as_str(),
        "failure_ratio": sink_health.failure_ratio,
        "drop_ratio": sink_health.drop_ratio,
        "records_processed": sink_health.records_processed,
        "failed_batch_count": sink_health.failed_batch_count,
        "last_ingestion_time": sink_health.last_ingestion_time,
    }))
    .into_response()
}

async fn ready(State(state): State<AppState>) -> Response {
    let pipeline = state.pipeline.read().clone();
    if pipeline.ready {
        (StatusCode::OK, Json(json!({"ready": true}))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"ready": false, "last_error": pipeline.last_error})),
        )
            .into_response()
    }
}

async fn pipeline_state(State(state): State<AppState>) -> Response {
    let pipeline = state.pipeline.read().clone();
    Json(pipeline).into_response()
}
