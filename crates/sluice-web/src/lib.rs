//! Axum operator surface for sluice: progress inspection and run control.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use sluice_core::{DocumentType, ProgressRecord};
use sluice_sync::{Orchestrator, SyncError, TriggerAck};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "sluice-web";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        let status = match &err {
            SyncError::ProgressNotFound(_) | SyncError::UnknownTenant(_) => StatusCode::NOT_FOUND,
            SyncError::InvalidAction { .. } | SyncError::Contended(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %err, "request failed");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

fn parse_document_type(raw: &str) -> Result<DocumentType, ApiError> {
    raw.parse().map_err(|err: sluice_core::ParseEnumError| ApiError {
        status: StatusCode::BAD_REQUEST,
        message: err.to_string(),
    })
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/tenants/{tenant}/progress", get(progress_handler))
        .route("/tenants/{tenant}/ingest", post(ingest_handler))
        .route("/tenants/{tenant}/force-refresh", post(force_refresh_handler))
        .route("/tenants/{tenant}/{document_type}/retry", post(retry_handler))
        .route("/tenants/{tenant}/{document_type}/pause", post(pause_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(
    port: u16,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "operator api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn progress_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(tenant): AxumPath<String>,
) -> Result<Json<Vec<ProgressRecord>>, ApiError> {
    Ok(Json(state.orchestrator.progress_for_tenant(&tenant).await?))
}

async fn ingest_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(tenant): AxumPath<String>,
) -> Result<Json<BTreeMap<DocumentType, TriggerAck>>, ApiError> {
    Ok(Json(state.orchestrator.start_ingestion(&tenant).await?))
}

async fn force_refresh_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(tenant): AxumPath<String>,
) -> Result<Json<BTreeMap<DocumentType, TriggerAck>>, ApiError> {
    Ok(Json(state.orchestrator.force_full_refresh(&tenant).await?))
}

async fn retry_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((tenant, document_type)): AxumPath<(String, String)>,
) -> Result<Json<TriggerAck>, ApiError> {
    let document_type = parse_document_type(&document_type)?;
    Ok(Json(state.orchestrator.retry_failed(&tenant, document_type).await?))
}

async fn pause_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((tenant, document_type)): AxumPath<(String, String)>,
) -> Result<Json<ProgressRecord>, ApiError> {
    let document_type = parse_document_type(&document_type)?;
    Ok(Json(state.orchestrator.pause(&tenant, document_type).await?))
}
