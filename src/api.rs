//! REST API Server for the Document Intake Orchestrator
//!
//! Exposes run submission, status, execution log and cancellation
//! over HTTP. Integrates with frontend UI.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::TaskInput;
use crate::orchestrator::Orchestrator;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SubmitRunRequest {
    pub entity_id: String,
    pub category: String,
    pub document_name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

fn status_for(error: &EngineError) -> StatusCode {
    match error {
        EngineError::InvalidTaskInput(_)
        | EngineError::UnknownTaskCategory(_)
        | EngineError::InvalidPlan(_) => StatusCode::BAD_REQUEST,
        EngineError::RunNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::RunAlreadyTerminal(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn failure(error: EngineError) -> (StatusCode, Json<ApiResponse>) {
    (status_for(&error), Json(ApiResponse::error(error.to_string())))
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Run Endpoints
/// =============================

async fn submit_run(
    State(state): State<ApiState>,
    Json(req): Json<SubmitRunRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    info!(
        entity_id = %req.entity_id,
        document_name = %req.document_name,
        "Received run submission"
    );

    let task = TaskInput {
        entity_id: req.entity_id,
        category: req.category,
        document_name: req.document_name,
        payload: req.payload,
    };

    match state.orchestrator.start_run(task).await {
        Ok(run_id) => (
            StatusCode::ACCEPTED,
            Json(ApiResponse::success(serde_json::json!({
                "run_id": run_id,
            }))),
        ),
        Err(e) => failure(e),
    }
}

async fn run_status(
    State(state): State<ApiState>,
    Path(run_id): Path<Uuid>,
) -> (StatusCode, Json<ApiResponse>) {
    match state.orchestrator.get_run_result(run_id).await {
        Ok(status) => (StatusCode::OK, Json(ApiResponse::success(status))),
        Err(e) => failure(e),
    }
}

async fn run_log(
    State(state): State<ApiState>,
    Path(run_id): Path<Uuid>,
) -> (StatusCode, Json<ApiResponse>) {
    match state.orchestrator.get_execution_log(run_id).await {
        Ok(entries) => (
            StatusCode::OK,
            Json(ApiResponse::success(serde_json::json!({
                "run_id": run_id,
                "entries": entries,
            }))),
        ),
        Err(e) => failure(e),
    }
}

async fn cancel_run(
    State(state): State<ApiState>,
    Path(run_id): Path<Uuid>,
) -> (StatusCode, Json<ApiResponse>) {
    match state.orchestrator.cancel_run(run_id).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(ApiResponse::success(serde_json::json!({
                "run_id": run_id,
                "cancellation": "requested",
            }))),
        ),
        Err(e) => failure(e),
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(orchestrator: Arc<Orchestrator>) -> Router {
    let state = ApiState { orchestrator };

    Router::new()
        .route("/health", get(health))
        .route("/api/runs", post(submit_run))
        .route("/api/runs/:run_id", get(run_status))
        .route("/api/runs/:run_id/log", get(run_log))
        .route("/api/runs/:run_id/cancel", post(cancel_run))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    orchestrator: Arc<Orchestrator>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(orchestrator);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}
