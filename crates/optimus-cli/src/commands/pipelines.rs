//! Pipeline commands.

use anyhow::Result;
use serde_json::json;

use super::ApiClient;

pub async fn list(api_url: &str) -> Result<()> {
    let pipelines = ApiClient::new(api_url).get("/api/v1/pipelines").await?;
    for p in pipelines.as_array().into_iter().flatten() {
        println!(
            "{:<16} {:<32} {:<12} {:<8} {}",
            p["name"].as_str().unwrap_or("?"),
            p["repository"].as_str().unwrap_or("?"),
            p["branch"].as_str().unwrap_or("?"),
            if p["active"] == true { "active" } else { "inactive" },
            p["last_status"].as_str().unwrap_or("-")
        );
    }
    Ok(())
}

pub async fn trigger(
    api_url: &str,
    pipeline: &str,
    branch: Option<String>,
    commit: Option<String>,
) -> Result<()> {
    let body = json!({ "branch": branch, "commit": commit, "actor": std::env::var("USER").ok() });
    let execution = ApiClient::new(api_url)
        .post(&format!("/api/v1/pipelines/{}/trigger", pipeline), Some(&body))
        .await?;
    println!(
        "Queued execution {} of '{}'",
        execution["id"].as_str().unwrap_or("?"),
        pipeline
    );
    Ok(())
}
