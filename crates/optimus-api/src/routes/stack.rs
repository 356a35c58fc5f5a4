//! Stack provisioning endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use optimus_core::outputs::StackOutputs;
use optimus_provisioner::{ChannelSnapshot, TeardownReport};
use serde_json::{Value, json};

use crate::AppState;
use crate::error::ApiError;
use crate::services::stack::StackStatus;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(get_stack).delete(teardown_stack))
        .route("/provision", post(provision_stack))
        .route("/outputs", get(get_outputs))
        .route("/signals", get(list_signals))
}

async fn get_stack(State(state): State<AppState>) -> Json<StackStatus> {
    Json(state.stack.status().await)
}

/// Start provisioning. Progress is visible through `GET /api/v1/stack`.
async fn provision_stack(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    state.stack.start_provision().await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "stack": state.stack.definition().name, "phase": "provisioning" })),
    ))
}

async fn get_outputs(State(state): State<AppState>) -> Result<Json<StackOutputs>, ApiError> {
    Ok(Json(state.stack.outputs().await?))
}

async fn list_signals(State(state): State<AppState>) -> Json<Vec<ChannelSnapshot>> {
    Json(state.signals.list().await)
}

async fn teardown_stack(State(state): State<AppState>) -> Result<Json<TeardownReport>, ApiError> {
    Ok(Json(state.stack.teardown().await?))
}
