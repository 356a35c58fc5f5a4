//! Pipeline and execution endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use optimus_core::ExecutionId;
use optimus_core::pipeline::{PipelineExecution, TriggerInfo, TriggerKind};
use optimus_scheduler::PipelineSummary;
use serde::Deserialize;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/pipelines", get(list_pipelines))
        .route("/pipelines/{name}/trigger", post(trigger_pipeline))
        .route("/pipelines/{name}/executions", get(list_executions))
        .route("/executions/{id}", get(get_execution))
}

async fn list_pipelines(State(state): State<AppState>) -> Json<Vec<PipelineSummary>> {
    Json(state.scheduler.list_pipelines().await)
}

#[derive(Debug, Default, Deserialize)]
struct TriggerRequest {
    branch: Option<String>,
    commit: Option<String>,
    actor: Option<String>,
}

async fn trigger_pipeline(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Option<Json<TriggerRequest>>,
) -> Result<(StatusCode, Json<PipelineExecution>), ApiError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let trigger = TriggerInfo {
        kind: TriggerKind::Manual,
        branch: req.branch,
        commit: req.commit,
        actor: req.actor,
    };
    let execution = state.scheduler.trigger(&name, trigger).await?;
    Ok((StatusCode::ACCEPTED, Json(execution)))
}

async fn list_executions(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Vec<PipelineExecution>>, ApiError> {
    Ok(Json(state.scheduler.executions(&name).await?))
}

async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PipelineExecution>, ApiError> {
    let id: ExecutionId = id
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid execution id: {}", id)))?;
    Ok(Json(state.scheduler.execution(id).await?))
}
