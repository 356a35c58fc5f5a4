//! Stack commands.

use anyhow::{Result, bail};
use std::time::Duration;

use super::ApiClient;

fn print_nodes(status: &serde_json::Value) {
    if let Some(nodes) = status["nodes"].as_object() {
        for (id, node) in nodes {
            let state = node["state"].as_str().unwrap_or("?");
            let detail = match state {
                "materialized" => node["physical_id"].as_str().unwrap_or_default().to_string(),
                "failed" => node["reason"].as_str().unwrap_or_default().to_string(),
                "deferred" => format!("waiting on {}", node["gate"].as_str().unwrap_or("?")),
                "waiting" => node["callback_url"].as_str().unwrap_or_default().to_string(),
                _ => String::new(),
            };
            println!(
                "  {:<24} {:<18} {:<13} {}",
                id,
                node["kind"].as_str().unwrap_or("?"),
                state,
                detail
            );
        }
    }
}

pub async fn status(api_url: &str) -> Result<()> {
    let status = ApiClient::new(api_url).get("/api/v1/stack").await?;
    println!(
        "Stack '{}' ({}): {}",
        status["name"].as_str().unwrap_or("?"),
        status["region"].as_str().unwrap_or("?"),
        status["phase"].as_str().unwrap_or("?")
    );
    print_nodes(&status);
    if let Some(error) = status["last_error"].as_str() {
        println!("Last error: {}", error);
    }
    Ok(())
}

/// Start provisioning; with `wait`, poll until the run ends.
pub async fn provision(api_url: &str, wait: bool) -> Result<()> {
    let client = ApiClient::new(api_url);
    client.post("/api/v1/stack/provision", None).await?;
    println!("Provisioning started");
    if !wait {
        return Ok(());
    }

    let mut announced = std::collections::BTreeSet::new();
    loop {
        tokio::time::sleep(Duration::from_secs(2)).await;
        let status = client.get("/api/v1/stack").await?;
        if let Some(nodes) = status["nodes"].as_object() {
            for (id, node) in nodes {
                if node["state"] == "waiting" && announced.insert(id.clone()) {
                    println!("Waiting for signal '{}'", id);
                }
            }
        }
        match status["phase"].as_str() {
            Some("provisioning") => continue,
            Some("provisioned") => {
                println!("Stack provisioned");
                print_nodes(&status);
                return Ok(());
            }
            Some(phase) => {
                print_nodes(&status);
                bail!(
                    "Provisioning ended in '{}': {}",
                    phase,
                    status["last_error"].as_str().unwrap_or("no details")
                );
            }
            None => bail!("Unexpected status response"),
        }
    }
}

pub async fn outputs(api_url: &str) -> Result<()> {
    let outputs = ApiClient::new(api_url).get("/api/v1/stack/outputs").await?;
    if let Some(map) = outputs.as_object() {
        for (name, output) in map {
            println!("{} = {}", name, output["value"].as_str().unwrap_or_default());
            if let Some(description) = output["description"].as_str() {
                println!("    {}", description);
            }
            if let Some(export) = output["export_name"].as_str() {
                println!("    exported as {}", export);
            }
        }
    }
    Ok(())
}

pub async fn teardown(api_url: &str) -> Result<()> {
    let report = ApiClient::new(api_url).delete("/api/v1/stack").await?;
    println!(
        "Cancelled {} pending signal(s)",
        report["cancelled_signals"].as_u64().unwrap_or(0)
    );
    for id in report["destroyed"].as_array().into_iter().flatten() {
        println!("✓ destroyed {}", id.as_str().unwrap_or("?"));
    }
    let failed = report["failed"].as_array().cloned().unwrap_or_default();
    for node in &failed {
        println!(
            "✗ {}: {}",
            node["id"].as_str().unwrap_or("?"),
            node["message"].as_str().unwrap_or("destroy failed")
        );
    }
    if !failed.is_empty() {
        bail!("{} resource(s) could not be destroyed", failed.len());
    }
    Ok(())
}
