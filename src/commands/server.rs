//! HTTP intake
//!
//! Accepts the download form as JSON, starts the job and answers immediately;
//! progress and results are polled per job id.

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use tracing::{info, warn};
use uuid::Uuid;

use super::download::DownloadRequest;
use crate::core::error_handling::DownloadError;
use crate::core::manager::DownloadManager;

pub const DEFAULT_PORT: u16 = 8080;

type ApiError = (StatusCode, Json<Value>);

fn bad_request(err: DownloadError) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": err.kind(), "message": err.to_string() })),
    )
}

fn not_found(id: Uuid) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "NotFound", "message": format!("no job {id}") })),
    )
}

pub fn build_router(manager: DownloadManager) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/download", post(start_download))
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/:id", get(job_status))
        .route("/api/jobs/:id/cancel", post(cancel_job))
        .with_state(manager)
}

/// Bind `0.0.0.0:port` and serve until the process exits
pub async fn serve(manager: DownloadManager, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Listening on http://{}", addr);
    axum::serve(listener, build_router(manager))
        .await
        .context("HTTP server stopped")
}

pub(crate) async fn index() -> &'static str {
    "Hello World!"
}

/// Start a job and echo the submitted form together with its id
pub(crate) async fn start_download(
    State(manager): State<DownloadManager>,
    Json(request): Json<DownloadRequest>,
) -> Result<Json<Value>, ApiError> {
    let default_policy = manager.settings().engine.default_failure_policy;
    let config = request.into_config(default_policy).map_err(|err| {
        warn!("Rejected download request: {}", err);
        bad_request(err)
    })?;
    let handle = manager.start(config).map_err(bad_request)?;

    let mut echo = serde_json::to_value(&request).unwrap_or_else(|_| json!({}));
    if let Value::Object(fields) = &mut echo {
        fields.insert("jobId".into(), json!(handle.id()));
    }
    Ok(Json(echo))
}

pub(crate) async fn list_jobs(State(manager): State<DownloadManager>) -> Json<Value> {
    Json(json!({ "items": manager.list() }))
}

pub(crate) async fn job_status(
    State(manager): State<DownloadManager>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let progress = manager.snapshot(id).ok_or_else(|| not_found(id))?;
    Ok(Json(json!({
        "progress": progress,
        "result": manager.result(id),
    })))
}

pub(crate) async fn cancel_job(
    State(manager): State<DownloadManager>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    if manager.cancel(id) {
        Ok(Json(json!({ "ok": true })))
    } else {
        Err(not_found(id))
    }
}
