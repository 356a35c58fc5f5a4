//! CLI command implementations.

pub mod dry_run;
pub mod executions;
pub mod pipelines;
pub mod signal;
pub mod stack;

use anyhow::{Context, Result, bail};
use optimus_config::load_stack;
use optimus_core::resolve;
use optimus_provisioner::orchestrator::gated_nodes;
use serde_json::Value;

/// Thin JSON client for the API server.
pub struct ApiClient {
    base: String,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(api_url: &str) -> Self {
        Self {
            base: api_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        self.send(self.http.get(self.url(path))).await
    }

    pub async fn post(&self, path: &str, body: Option<&Value>) -> Result<Value> {
        let mut request = self.http.post(self.url(path));
        if let Some(body) = body {
            request = request.json(body);
        }
        self.send(request).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value> {
        self.send(self.http.delete(self.url(path))).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value> {
        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to reach API server at {}", self.base))?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let message = body["error"].as_str().unwrap_or("request failed");
            bail!("{} ({})", message, status);
        }
        Ok(body)
    }
}

pub fn validate(path: &str) -> Result<()> {
    match load_stack(path) {
        Ok(stack) => {
            println!(
                "Stack '{}' is valid: {} resources, {} pipelines, {} outputs",
                stack.name,
                stack.resources.len(),
                stack.pipelines.len(),
                stack.outputs.len()
            );
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Print the order resources would be created in, marking signal gates.
pub fn plan(path: &str) -> Result<()> {
    let stack = load_stack(path).with_context(|| format!("Failed to load stack: {}", path))?;
    let order = resolve(stack.resources.clone())?;
    let gates = gated_nodes(&order)?;

    println!("Stack '{}' ({})", stack.name, stack.region);
    for (i, node) in order.iter().enumerate() {
        match gates.get(&node.id) {
            Some(held) => println!(
                "{:>3}. {} [{}] gate, holds back: {}",
                i + 1,
                node.id,
                node.kind,
                if held.is_empty() { "-".to_string() } else { held.join(", ") }
            ),
            None => println!("{:>3}. {} [{}]", i + 1, node.id, node.kind),
        }
    }
    for pipeline in &stack.pipelines {
        println!(
            "pipeline '{}' activates with {} ({} @ {})",
            pipeline.name,
            pipeline.node_id,
            pipeline.source.full_name(),
            pipeline.source.branch
        );
    }
    Ok(())
}
