//! API routes.

pub mod health;
pub mod pipelines;
pub mod signals;
pub mod stack;
pub mod webhooks;

use crate::AppState;
use axum::Router;

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", api_router())
        .nest("/signals", signals::router())
        .nest("/webhooks", webhooks::router())
        .merge(health::router())
        .with_state(state)
}

fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/stack", stack::router())
        .merge(pipelines::router())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use optimus_config::parse_stack;
    use optimus_config::system::{ProviderConfig, ServerConfig};
    use optimus_provisioner::ChannelState;
    use serde_json::{Value, json};
    use std::time::Duration;
    use tower::ServiceExt;

    const STACK: &str = r#"
        stack "optimus" region="us-west-1" account="619326977873"

        resource "vpc" kind="network"
        resource "instance" kind="compute" depends-on="vpc" {
            instance-type "t2.micro"
            key-name "galvitron-key-2"
        }
        signal "bootstrap" timeout=60 depends-on="instance"
        resource "deployment-group" kind="deployment-group" depends-on="instance"
        resource "api-build" kind="build-project"
        resource "api-pipeline" kind="pipeline" {
            depends-on "api-build" "deployment-group" "bootstrap"
        }

        pipeline "api" node="api-pipeline" {
            source owner="mzienert" repo="optimus-api" branch="master"
            build project="api-build"
            deploy group="deployment-group"
            rollback failed-deployment=#true
        }

        output "InstancePublicIP" value="${instance.public_ip}" description="Public IP address of the instance"
    "#;

    async fn state() -> AppState {
        let server = ServerConfig {
            callback_secret: Some("test-secret".to_string()),
            ..Default::default()
        };
        AppState::new(&server, &ProviderConfig::default(), parse_stack(STACK).unwrap()).await
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn wait_for_phase(app: &Router, phase: &str) -> Value {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let (_, body) = send(app, "GET", "/api/v1/stack", None).await;
                if body["phase"] == phase {
                    return body;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("stack never reached {}", phase))
    }

    /// Path part of the callback URL of the `bootstrap` channel, once it is waited on.
    async fn callback_path(state: &AppState) -> String {
        let channel = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(channel) = state.signals.by_node("bootstrap").await {
                    let status = state.stack.status().await;
                    if matches!(
                        status.nodes["bootstrap"].progress,
                        crate::services::stack::NodeProgress::Waiting { .. }
                    ) {
                        return channel;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        let url = state.signals.callback_url(channel.id()).unwrap();
        url.trim_start_matches("http://localhost:8080").to_string()
    }

    #[tokio::test]
    async fn test_health() {
        let app = router(state().await);
        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_provision_signal_and_teardown() {
        let state = state().await;
        let app = router(state.clone());

        let (status, _) = send(&app, "POST", "/api/v1/stack/provision", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let path = callback_path(&state).await;

        // Only one run at a time.
        let (status, body) = send(&app, "POST", "/api/v1/stack/provision", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("already provisioning"));

        // The pipeline is held back by the gate.
        let (status, _) = send(&app, "POST", "/api/v1/pipelines/api/trigger", None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = send(
            &app,
            "PUT",
            &path,
            Some(json!({
                "Status": "SUCCESS",
                "Reason": "Configuration Complete",
                "UniqueId": "ID1234",
                "Data": "Application has completed configuration."
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accepted"], true);

        let stack = wait_for_phase(&app, "provisioned").await;
        assert_eq!(stack["nodes"]["api-pipeline"]["state"], "materialized");

        // A second report is acknowledged but changes nothing.
        let (status, body) = send(&app, "PUT", &path, Some(json!({ "Status": "FAILURE" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accepted"], false);
        assert_eq!(body["state"], "success");

        let (status, outputs) = send(&app, "GET", "/api/v1/stack/outputs", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(
            outputs["InstancePublicIP"]["value"]
                .as_str()
                .unwrap()
                .starts_with("203.0.113.")
        );

        let (_, pipelines) = send(&app, "GET", "/api/v1/pipelines", None).await;
        assert_eq!(pipelines[0]["name"], "api");
        assert_eq!(pipelines[0]["active"], true);

        let (status, execution) = send(
            &app,
            "POST",
            "/api/v1/pipelines/api/trigger",
            Some(json!({ "commit": "4f2a9c1" })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let id = execution["id"].as_str().unwrap().to_string();
        let (status, execution) = send(&app, "GET", &format!("/api/v1/executions/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(execution["pipeline"], "api");

        let (status, report) = send(&app, "DELETE", "/api/v1/stack", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["destroyed"].as_array().unwrap().len(), 6);
        assert_eq!(report["destroyed"][0], "api-pipeline");

        let (status, _) = send(&app, "POST", "/api/v1/pipelines/api/trigger", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        let (status, _) = send(&app, "GET", "/api/v1/stack/outputs", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_signal_rejects_bad_token_and_ignores_bad_body() {
        let state = state().await;
        let app = router(state.clone());
        send(&app, "POST", "/api/v1/stack/provision", None).await;
        let path = callback_path(&state).await;

        let forged = format!("{}00", path.trim_end_matches(|c: char| c != '/'));
        let (status, _) = send(&app, "PUT", &forged, Some(json!({ "Status": "SUCCESS" }))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, "PUT", "/signals/not-a-uuid/abc", Some(json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(&app, "PUT", &path, Some(json!({ "Status": "IN_PROGRESS" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accepted"], false);
        let (status, _) = send(&app, "PUT", &path, Some(json!("garbage"))).await;
        assert_eq!(status, StatusCode::OK);

        let channel = state.signals.by_node("bootstrap").await.unwrap();
        assert_eq!(channel.state(), ChannelState::Pending);

        // Failure fails the pipeline behind the gate.
        send(&app, "PUT", &path, Some(json!({ "Status": "FAILURE", "Reason": "yum failed" }))).await;
        let stack = wait_for_phase(&app, "partial").await;
        assert_eq!(stack["nodes"]["api-pipeline"]["state"], "failed");
        assert_eq!(stack["nodes"]["api-build"]["state"], "materialized");
        assert!(!state.scheduler.is_active("api").await);
    }

    #[tokio::test]
    async fn test_github_push_triggers_active_pipeline() {
        let state = state().await;
        state.scheduler.activate("api").await.unwrap();
        let app = router(state.clone());

        let payload = json!({
            "ref": "refs/heads/master",
            "after": "9f1c2e7",
            "repository": { "full_name": "mzienert/optimus-api" },
            "pusher": { "name": "mzienert" }
        });
        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/github")
            .header("X-GitHub-Event", "push")
            .body(Body::from(payload.to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let executions = state.scheduler.executions("api").await.unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].trigger.commit.as_deref(), Some("9f1c2e7"));
    }
}
