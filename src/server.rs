//! HTTP read API over the running pipeline.
//!
//! Exposes the prediction store and counters, plus the two explicit
//! operator actions: pump control and model reload.
//!
//! ```text
//! GET  /health
//! GET  /api/stats
//! GET  /api/buffers
//! GET  /api/predictions/summary
//! GET  /api/predictions/:sensor_id?limit=N
//! GET  /api/predictions/:sensor_id/latest
//! POST /api/pump/control      {sensor_id, command}
//! POST /api/model/reload
//! ```

use crate::core::buffer::{KeyStatus, RollingBuffer};
use crate::core::dispatch::{DispatchError, Dispatcher};
use crate::core::inference::{ArtifactError, InferenceEngine, PredictionRecord};
use crate::core::store::{CityRiskSummary, PredictionStore};
use crate::pipeline::PipelineHandle;
use crate::telemetry::{SharedStats, StatsSnapshot};
use crate::transport::types::{ActuatorCommand, ActuatorMessage};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Shared server state
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<PredictionStore>,
    pub engine: Arc<InferenceEngine>,
    pub dispatcher: Arc<Dispatcher>,
    pub buffer: Arc<RollingBuffer>,
    pub stats: SharedStats,
}

impl ApiState {
    pub fn from_pipeline(handle: &PipelineHandle) -> Self {
        Self {
            store: Arc::clone(&handle.store),
            engine: Arc::clone(&handle.engine),
            dispatcher: Arc::clone(&handle.dispatcher),
            buffer: Arc::clone(&handle.buffer),
            stats: Arc::clone(&handle.stats),
        }
    }
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub model_version: Option<String>,
}

/// Error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &str, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
}

#[derive(Serialize)]
pub struct StatsResponse {
    pub counters: StatsSnapshot,
    pub buffered_readings: usize,
    pub buffered_keys: usize,
    pub pending_writes: usize,
    pub model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct PumpRequest {
    pub sensor_id: String,
    pub command: String,
}

#[derive(Serialize)]
pub struct PumpResponse {
    pub status: String,
    pub sensor_id: String,
    pub message: ActuatorMessage,
}

#[derive(Serialize)]
pub struct ReloadResponse {
    pub status: String,
    pub model_version: String,
    pub classifier: String,
}

/// GET /health
async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        model_version: state.engine.model_version(),
    })
}

/// GET /api/stats
async fn stats(State(state): State<ApiState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        counters: state.stats.snapshot(),
        buffered_readings: state.buffer.reading_count(),
        buffered_keys: state.buffer.key_count(),
        pending_writes: state.store.pending_count(),
        model_version: state.engine.model_version(),
    })
}

/// GET /api/buffers
async fn buffers(State(state): State<ApiState>) -> Json<Vec<KeyStatus>> {
    Json(state.buffer.status())
}

/// GET /api/predictions/summary
async fn summary(State(state): State<ApiState>) -> Json<Vec<CityRiskSummary>> {
    Json(state.store.risk_summary())
}

/// GET /api/predictions/:sensor_id
async fn history(
    State(state): State<ApiState>,
    Path(sensor_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Json<Vec<PredictionRecord>> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    let store = Arc::clone(&state.store);

    // History can fall through to the monthly files on disk.
    let records = tokio::task::spawn_blocking(move || store.history(&sensor_id, limit))
        .await
        .unwrap_or_default();
    Json(records)
}

/// GET /api/predictions/:sensor_id/latest
async fn latest(
    State(state): State<ApiState>,
    Path(sensor_id): Path<String>,
) -> Result<Json<PredictionRecord>, ApiError> {
    let store = Arc::clone(&state.store);
    let id = sensor_id.clone();

    // A cache miss reads the monthly files.
    let record = tokio::task::spawn_blocking(move || store.latest(&id))
        .await
        .ok()
        .flatten();
    record.map(Json).ok_or_else(|| {
        api_error(
            StatusCode::NOT_FOUND,
            "NO_PREDICTION",
            format!("No prediction for sensor '{sensor_id}'"),
        )
    })
}

/// POST /api/pump/control
async fn pump_control(
    State(state): State<ApiState>,
    Json(request): Json<PumpRequest>,
) -> Result<Json<PumpResponse>, ApiError> {
    let command: ActuatorCommand = request
        .command
        .parse()
        .map_err(|e: String| api_error(StatusCode::BAD_REQUEST, "INVALID_COMMAND", e))?;

    let message = state
        .dispatcher
        .control_actuator(&request.sensor_id, command)
        .await
        .map_err(|e| match e {
            DispatchError::UnknownSensor(_) => {
                api_error(StatusCode::NOT_FOUND, "UNKNOWN_SENSOR", e.to_string())
            }
            DispatchError::Registry(_) => {
                api_error(StatusCode::SERVICE_UNAVAILABLE, "REGISTRY_ERROR", e.to_string())
            }
            DispatchError::Transport(_) => {
                tracing::error!("Pump command for {} failed: {e}", request.sensor_id);
                api_error(StatusCode::BAD_GATEWAY, "TRANSPORT_ERROR", e.to_string())
            }
            DispatchError::Encode(_) => {
                api_error(StatusCode::INTERNAL_SERVER_ERROR, "ENCODE_ERROR", e.to_string())
            }
        })?;

    Ok(Json(PumpResponse {
        status: "ok".to_string(),
        sensor_id: request.sensor_id,
        message,
    }))
}

/// POST /api/model/reload
async fn reload_model(State(state): State<ApiState>) -> Result<Json<ReloadResponse>, ApiError> {
    let engine = Arc::clone(&state.engine);
    let reloaded = tokio::task::spawn_blocking(move || engine.reload())
        .await
        .map_err(|e| {
            tracing::error!("Model reload task failed: {e}");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "RELOAD_FAILED", e.to_string())
        })?;

    let artifact = reloaded.map_err(|e| match e {
        ArtifactError::NoSource => {
            api_error(StatusCode::SERVICE_UNAVAILABLE, "NO_MODEL_SOURCE", e.to_string())
        }
        ArtifactError::Io(_) | ArtifactError::Parse(_) | ArtifactError::Invalid(_) => {
            tracing::warn!("Model reload rejected: {e}");
            api_error(StatusCode::UNPROCESSABLE_ENTITY, "MODEL_LOAD_FAILED", e.to_string())
        }
    })?;

    tracing::info!("Model reloaded: {}", artifact.model_version);
    Ok(Json(ReloadResponse {
        status: "ok".to_string(),
        model_version: artifact.model_version.clone(),
        classifier: artifact.classifier.kind().to_string(),
    }))
}

/// Build the router without binding a socket.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/stats", get(stats))
        .route("/api/buffers", get(buffers))
        .route("/api/predictions/summary", get(summary))
        .route("/api/predictions/:sensor_id", get(history))
        .route("/api/predictions/:sensor_id/latest", get(latest))
        .route("/api/pump/control", post(pump_control))
        .route("/api/model/reload", post(reload_model))
        .layer(
            CorsLayer::new()
                .allow_origin([
                    HeaderValue::from_static("http://localhost"),
                    HeaderValue::from_static("http://127.0.0.1"),
                ])
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Run the HTTP server
pub async fn run(
    port: u16,
    state: ApiState,
) -> anyhow::Result<(SocketAddr, tokio::sync::oneshot::Sender<()>)> {
    let app = router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    tracing::info!("Read API listening on http://{}", actual_addr);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Server shutdown signal received");
            })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    Ok((actual_addr, shutdown_tx))
}
