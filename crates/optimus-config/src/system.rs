//! Server configuration parsing.
//!
//! ```kdl
//! server {
//!     listen "0.0.0.0:8080"
//!     public-url "https://optimus.example.com"
//!     callback-secret "change-me"
//!     webhook-secret "github-secret"
//! }
//! stack-file "optimus.kdl"
//! provider "local" fail="table"
//! ```

use crate::helpers::{
    get_all_string_args, get_first_string_arg, get_string_list_prop, get_string_setting,
};
use crate::{ConfigError, ConfigResult};
use kdl::KdlDocument;
use serde::{Deserialize, Serialize};

/// Server-wide configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemConfig {
    pub server: ServerConfig,
    /// Stack document to provision.
    pub stack_file: Option<String>,
    pub provider: ProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP server binds to.
    pub listen: String,
    /// Base URL bootstrap scripts use to reach the callback endpoint.
    pub public_url: String,
    /// Key for signing callback URLs.
    pub callback_secret: Option<String>,
    /// Secret for verifying GitHub webhook signatures.
    pub webhook_secret: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            public_url: "http://localhost:8080".to_string(),
            callback_secret: None,
            webhook_secret: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub backend: String,
    /// Node ids the local backend refuses to materialize.
    pub fail_nodes: Vec<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            backend: "local".to_string(),
            fail_nodes: Vec::new(),
        }
    }
}

/// Parse server configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "server" => {
                if let Some(listen) = get_string_setting(node, "listen") {
                    config.server.listen = listen;
                }
                if let Some(url) = get_string_setting(node, "public-url") {
                    config.server.public_url = url.trim_end_matches('/').to_string();
                }
                config.server.callback_secret = get_string_setting(node, "callback-secret");
                config.server.webhook_secret = get_string_setting(node, "webhook-secret");
            }
            "stack-file" => {
                config.stack_file = Some(get_first_string_arg(node).ok_or_else(|| {
                    ConfigError::MissingField("stack-file path".to_string())
                })?);
            }
            "provider" => {
                let backend = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("provider backend".to_string()))?;
                if backend != "local" {
                    return Err(ConfigError::InvalidValue {
                        field: "provider".to_string(),
                        message: format!("unknown provider backend: {}", backend),
                    });
                }
                let mut fail_nodes = get_string_list_prop(node, "fail");
                if let Some(children) = node.children() {
                    for c in children.nodes().iter().filter(|c| c.name().value() == "fail") {
                        fail_nodes.extend(get_all_string_args(c));
                    }
                }
                fail_nodes.dedup();
                config.provider = ProviderConfig {
                    backend,
                    fail_nodes,
                };
            }
            _ => {}
        }
    }

    if !config.server.public_url.starts_with("http://")
        && !config.server.public_url.starts_with("https://")
    {
        return Err(ConfigError::InvalidValue {
            field: "public-url".to_string(),
            message: format!("expected an http(s) URL, got {}", config.server.public_url),
        });
    }

    Ok(config)
}

/// Read and parse server configuration from disk.
pub fn load_system_config(path: impl AsRef<std::path::Path>) -> ConfigResult<SystemConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_system_config(&text)
}
