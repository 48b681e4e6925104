// docflow HTTP server
// Thin axum surface over the event trigger and the stores

//! # Server Module
//!
//! ```text
//! Event source / upload service
//!        ↓ HTTP
//! Server (this module)   POST /api/events, POST /api/documents, GET ...
//!        ↓ function calls
//! EventTrigger → WorkflowEngine → DocumentStore
//! ```
//!
//! Handlers only translate between JSON and the engine; all behaviour lives
//! in the engine layer.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router, Server,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::engine::{DocumentStore, EventTrigger, WorkflowEngine};
use crate::models::{DocumentRecord, TriggerEvent};
use crate::PipelineError;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub trigger: Arc<EventTrigger>,
}

impl AppState {
    fn engine(&self) -> &WorkflowEngine {
        self.trigger.engine()
    }

    fn documents(&self) -> Arc<dyn DocumentStore> {
        self.engine().documents()
    }
}

/// JSON error body, status derived from the error kind
pub struct ApiError(PipelineError);

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            PipelineError::Validation(_) | PipelineError::InvalidEvent(_) => {
                StatusCode::BAD_REQUEST
            }
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::AlreadyFinalized(_) | PipelineError::Conflict(_) => {
                StatusCode::CONFLICT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "error": {
                "message": self.0.to_string(),
                "type": self.0.kind(),
            }
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Serialize, Deserialize)]
pub struct RunAccepted {
    pub run_id: Uuid,
}

/// Registers a pending Document Record, standing in for the upload path
#[derive(Debug, Deserialize)]
pub struct RegisterDocument {
    #[serde(default, rename = "documentId")]
    pub document_id: Option<String>,
    #[serde(rename = "userId")]
    pub user_id: String,
}

pub struct DocflowServer {
    config: ServerConfig,
    cors_enabled: bool,
    trigger: Arc<EventTrigger>,
}

impl DocflowServer {
    pub fn new(trigger: Arc<EventTrigger>) -> Self {
        Self {
            config: ServerConfig::default(),
            cors_enabled: true,
            trigger,
        }
    }

    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cors(mut self, enabled: bool) -> Self {
        self.cors_enabled = enabled;
        self
    }

    pub fn create_router(&self) -> Router {
        let app = Router::new()
            .route("/api/events", post(receive_event))
            .route("/api/events/retry", post(retry_event))
            .route("/api/documents", post(register_document))
            .route("/api/documents/:id", get(get_document))
            .route("/api/runs/:id", get(get_run))
            .route("/health", get(health_check))
            .with_state(AppState {
                trigger: Arc::clone(&self.trigger),
            });

        if self.cors_enabled {
            app.layer(CorsLayer::permissive())
        } else {
            app
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let app = self.create_router();
        let addr = self.config.bind_address();

        info!("docflow listening on http://{}", addr);
        info!("Trigger endpoint: POST http://{}/api/events", addr);

        Server::bind(&addr.parse()?)
            .serve(app.into_make_service())
            .await?;
        Ok(())
    }
}

async fn receive_event(
    State(state): State<AppState>,
    Json(event): Json<TriggerEvent>,
) -> ApiResult<impl IntoResponse> {
    debug!("Received event {} ({:?})", event.name, event.id);
    let run_id = state.trigger.handle(event).await?;
    Ok((StatusCode::ACCEPTED, Json(RunAccepted { run_id })))
}

async fn retry_event(
    State(state): State<AppState>,
    Json(event): Json<TriggerEvent>,
) -> ApiResult<impl IntoResponse> {
    let run_id = state.trigger.retry_document(event).await?;
    Ok((StatusCode::ACCEPTED, Json(RunAccepted { run_id })))
}

async fn register_document(
    State(state): State<AppState>,
    Json(request): Json<RegisterDocument>,
) -> ApiResult<impl IntoResponse> {
    let id = request
        .document_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let record = state
        .documents()
        .insert_document(DocumentRecord::pending(id, request.user_id))
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn get_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DocumentRecord>> {
    state
        .documents()
        .get_document(&id)
        .await?
        .map(Json)
        .ok_or_else(|| PipelineError::NotFound(format!("document {}", id)).into())
}

async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let run = state
        .engine()
        .get_run(&run_id)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("run {}", run_id)))?;
    Ok(Json(run))
}

async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "docflow" }))
}
