//! Report a bootstrap signal, the way an instance's bootstrap script does.

use anyhow::{Context, Result, bail};
use optimus_provisioner::{CallbackBody, SignalPayload, SignalStatus};

pub async fn send(
    url: &str,
    status: SignalStatus,
    reason: Option<String>,
    unique_id: Option<String>,
    data: Option<String>,
) -> Result<()> {
    let parsed = url::Url::parse(url).with_context(|| format!("Invalid callback URL: {}", url))?;
    if !parsed.path().starts_with("/signals/") {
        bail!("Not a signal callback URL: {}", url);
    }

    let body = CallbackBody::new(
        status,
        SignalPayload {
            reason,
            unique_id,
            data,
        },
    );
    let response = reqwest::Client::new()
        .put(parsed)
        .json(&body)
        .send()
        .await
        .with_context(|| format!("Failed to reach {}", url))?;

    let code = response.status();
    if !code.is_success() {
        bail!("Signal rejected ({})", code);
    }
    let reply: serde_json::Value = response.json().await.unwrap_or_default();
    if reply["accepted"] == true {
        println!("Signal accepted ({})", body.status);
    } else {
        println!(
            "Signal ignored, channel is already {}",
            reply["state"].as_str().unwrap_or("resolved")
        );
    }
    Ok(())
}
