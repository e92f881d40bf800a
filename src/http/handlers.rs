//! Route handlers.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::AppState;
use super::error::{AppError, AppResult};
use crate::model::{JobId, JobPayload, QueueJob, RunLinks, WorkflowId};
use crate::queue::EnqueueOptions;
use crate::tracker::WorkflowStatus;

/// Body of `POST /workflows`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchRequest {
    pub queue: String,
    pub name: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub workflow_id: Option<String>,
    pub actor: Option<String>,
    #[serde(default)]
    pub links: RunLinks,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchResponse {
    pub job_id: JobId,
    pub workflow_id: WorkflowId,
}

/// POST /workflows
///
/// Records the job and returns before any worker has seen it.
pub async fn launch(
    State(state): State<AppState>,
    Json(req): Json<LaunchRequest>,
) -> AppResult<(StatusCode, Json<LaunchResponse>)> {
    if req.name.trim().is_empty() {
        return Err(AppError::BadRequest("workflow name is empty".into()));
    }
    let mut options = EnqueueOptions::default().links(req.links);
    if let Some(id) = req.workflow_id {
        options = options.workflow_id(id);
    }
    if let Some(actor) = req.actor {
        options = options.actor(actor);
    }

    let job = state
        .queue
        .enqueue(&req.queue, JobPayload::new(req.name, req.data), options)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(LaunchResponse {
            job_id: job.id,
            workflow_id: job.workflow_id,
        }),
    ))
}

/// GET /workflows/{id}/status
pub async fn workflow_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<WorkflowStatus>> {
    let status = state.tracker.status(&WorkflowId::from(id)).await?;
    Ok(Json(status))
}

/// GET /workflows/{id}/events
pub async fn workflow_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Response> {
    Ok(state.bridge.response(WorkflowId::from(id)).await?)
}

/// GET /jobs/{id}
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<QueueJob>> {
    let id: JobId = id
        .parse()
        .map_err(|e| AppError::BadRequest(format!("invalid job id: {e}")))?;
    Ok(Json(state.queue.get(id).await?))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Response {
    match state.health.health_check().await {
        Ok(()) => Json(HealthResponse {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
        })
        .into_response(),
        Err(e) => {
            warn!(error = %e, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "unavailable",
                    version: env!("CARGO_PKG_VERSION"),
                }),
            )
                .into_response()
        }
    }
}
