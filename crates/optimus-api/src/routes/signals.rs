//! Bootstrap signal callback.
//!
//! The bootstrap script of an instance reports to the unguessable URL it was
//! handed: `PUT /signals/{channel_id}/{token}` with a body such as
//! `{"Status":"SUCCESS","Reason":"Configuration Complete","UniqueId":"ID1234","Data":"Application has completed configuration."}`.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::routing::put;
use axum::{Json, Router};
use optimus_core::{ChannelId, Error};
use optimus_provisioner::CallbackBody;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new().route("/{channel_id}/{token}", put(report_signal))
}

fn unknown_channel() -> ApiError {
    ApiError::NotFound("signal channel not found".to_string())
}

async fn report_signal(
    State(state): State<AppState>,
    Path((channel_id, token)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let channel_id: ChannelId = channel_id.parse().map_err(|_| unknown_channel())?;
    if !state.signals.verify_token(channel_id, &token) {
        warn!(channel = %channel_id, "Rejected signal with invalid token");
        return Err(unknown_channel());
    }
    let channel = state
        .signals
        .get(channel_id)
        .await
        .ok_or_else(unknown_channel)?;

    let report = serde_json::from_slice::<CallbackBody>(&body)
        .ok()
        .and_then(CallbackBody::into_report);
    let Some((status, payload)) = report else {
        warn!(channel = %channel_id, node = %channel.node_id(), "Ignoring malformed or non-terminal signal");
        return Ok(Json(json!({ "accepted": false, "state": channel.state() })));
    };

    match channel.report(status, payload) {
        Ok(()) => Ok(Json(json!({ "accepted": true, "state": channel.state() }))),
        Err(Error::AlreadyResolved(_)) => {
            info!(channel = %channel_id, state = %channel.state(), "Signal channel already resolved");
            Ok(Json(json!({ "accepted": false, "state": channel.state() })))
        }
        Err(e) => Err(e.into()),
    }
}
