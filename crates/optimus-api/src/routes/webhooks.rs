//! Webhook endpoints for Git providers.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use tracing::{info, warn};

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new().route("/github", post(github_webhook))
}

/// The parts of a GitHub push payload that select pipelines.
#[derive(Debug, Clone, PartialEq)]
struct PushEvent {
    repository_full_name: String,
    branch: String,
    after: Option<String>,
    pusher: Option<String>,
}

impl PushEvent {
    /// Parse a push payload. Tag pushes and branch deletions yield `None`.
    fn from_github_payload(payload: &serde_json::Value) -> Option<Self> {
        let branch = payload
            .get("ref")?
            .as_str()?
            .strip_prefix("refs/heads/")?
            .to_string();
        if payload.get("deleted").and_then(|d| d.as_bool()) == Some(true) {
            return None;
        }
        let repository_full_name = payload
            .get("repository")?
            .get("full_name")?
            .as_str()?
            .to_string();
        let after = payload
            .get("after")
            .and_then(|a| a.as_str())
            .map(String::from);
        let pusher = payload
            .get("pusher")
            .and_then(|p| p.get("name"))
            .and_then(|n| n.as_str())
            .map(String::from);

        Some(PushEvent {
            repository_full_name,
            branch,
            after,
            pusher,
        })
    }
}

/// Handle GitHub webhook events.
async fn github_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let event_type = headers
        .get("X-GitHub-Event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");

    if let Some(secret) = &state.webhook_secret {
        let signature = headers
            .get("X-Hub-Signature-256")
            .and_then(|v| v.to_str().ok());
        if !verify_github_signature(secret, &body, signature) {
            warn!(event = %event_type, "Invalid webhook signature");
            return Err(ApiError::Unauthorized("invalid webhook signature".to_string()));
        }
    }

    let payload: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid JSON: {}", e)))?;

    info!(
        event = %event_type,
        repo = ?payload.get("repository").and_then(|r| r.get("full_name")),
        "Received GitHub webhook"
    );

    match event_type {
        "push" => {
            let Some(push) = PushEvent::from_github_payload(&payload) else {
                info!("Push event without a branch head, ignoring");
                return Ok(StatusCode::OK.into_response());
            };
            let started = state
                .scheduler
                .handle_push(
                    &push.repository_full_name,
                    &push.branch,
                    push.after.clone(),
                    push.pusher.clone(),
                )
                .await?;
            info!(
                repo = %push.repository_full_name,
                branch = %push.branch,
                executions = started.len(),
                "Processed push event"
            );
            let executions: Vec<_> = started
                .iter()
                .map(|e| json!({ "pipeline": e.pipeline, "execution_id": e.id }))
                .collect();
            Ok((StatusCode::ACCEPTED, Json(json!({ "executions": executions }))).into_response())
        }
        "ping" => {
            info!("Ping event received - webhook is configured correctly");
            Ok(StatusCode::OK.into_response())
        }
        _ => {
            info!(event = %event_type, "Unhandled event type");
            Ok(StatusCode::OK.into_response())
        }
    }
}

/// Verify GitHub webhook signature.
fn verify_github_signature(secret: &str, body: &[u8], signature: Option<&str>) -> bool {
    let Some(signature) = signature else {
        return false;
    };

    // Signature format: "sha256=<hex>"
    let Some(sig_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };

    let Ok(sig_bytes) = hex::decode(sig_hex) else {
        return false;
    };

    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);

    mac.verify_slice(&sig_bytes).is_ok()
}
