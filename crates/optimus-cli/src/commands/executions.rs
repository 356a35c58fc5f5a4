//! Execution commands.

use anyhow::Result;
use serde_json::Value;

use super::ApiClient;

fn stage_line(stage: &Value) -> String {
    let name = stage["name"].as_str().unwrap_or("?");
    match stage["result"]["state"].as_str() {
        Some("succeeded") => {
            let artifact = stage["output_artifact"]["name"].as_str();
            match artifact {
                Some(a) => format!("✓ {} → {}", name, a),
                None => format!("✓ {}", name),
            }
        }
        Some("failed") => format!(
            "✗ {}: {}",
            name,
            stage["result"]["message"].as_str().unwrap_or_default()
        ),
        _ if stage["started_at"].is_string() => format!("▶ {}", name),
        _ => format!("○ {}", name),
    }
}

pub async fn list(api_url: &str, pipeline: &str, limit: usize) -> Result<()> {
    let executions = ApiClient::new(api_url)
        .get(&format!("/api/v1/pipelines/{}/executions", pipeline))
        .await?;
    for e in executions.as_array().into_iter().flatten().take(limit) {
        println!(
            "{}  {:<12} {:<10} {}",
            e["id"].as_str().unwrap_or("?"),
            e["status"].as_str().unwrap_or("?"),
            e["trigger"]["kind"].as_str().unwrap_or("?"),
            e["created_at"].as_str().unwrap_or("")
        );
    }
    Ok(())
}

pub async fn show(api_url: &str, id: &str) -> Result<()> {
    let e = ApiClient::new(api_url)
        .get(&format!("/api/v1/executions/{}", id))
        .await?;
    println!(
        "Execution {} of '{}': {}",
        id,
        e["pipeline"].as_str().unwrap_or("?"),
        e["status"].as_str().unwrap_or("?")
    );
    if let Some(commit) = e["trigger"]["commit"].as_str() {
        println!("Commit: {}", commit);
    }
    for stage in e["stages"].as_array().into_iter().flatten() {
        println!("  {}", stage_line(stage));
    }
    if let Some(reason) = e["cancel_reason"].as_str() {
        println!("Cancelled: {}", reason);
    }
    Ok(())
}
