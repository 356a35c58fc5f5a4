//! Optimus API Server

use anyhow::Context;
use clap::Parser;
use optimus_api::{AppState, routes};
use optimus_config::system::{SystemConfig, load_system_config};
use optimus_config::load_stack;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "optimus-server")]
#[command(about = "Optimus provisioning and pipeline server", long_about = None)]
struct Args {
    /// Server configuration file (KDL)
    #[arg(short, long, env = "OPTIMUS_CONFIG")]
    config: Option<PathBuf>,

    /// Stack document to serve
    #[arg(short, long, env = "OPTIMUS_STACK_FILE")]
    stack: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, env = "OPTIMUS_LISTEN")]
    listen: Option<String>,

    /// Base URL bootstrap scripts use to reach this server
    #[arg(long, env = "OPTIMUS_PUBLIC_URL")]
    public_url: Option<String>,

    /// Key for signing callback URLs
    #[arg(long, env = "OPTIMUS_CALLBACK_SECRET", hide_env_values = true)]
    callback_secret: Option<String>,

    /// Secret for verifying GitHub webhook signatures
    #[arg(long, env = "OPTIMUS_WEBHOOK_SECRET", hide_env_values = true)]
    webhook_secret: Option<String>,

    /// Provision the stack as soon as the server is up
    #[arg(long, env = "OPTIMUS_PROVISION_ON_START")]
    provision_on_start: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_system_config(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => SystemConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if let Some(url) = args.public_url {
        config.server.public_url = url.trim_end_matches('/').to_string();
    }
    if args.callback_secret.is_some() {
        config.server.callback_secret = args.callback_secret;
    }
    if args.webhook_secret.is_some() {
        config.server.webhook_secret = args.webhook_secret;
    }

    let stack_path = args
        .stack
        .or_else(|| config.stack_file.clone().map(PathBuf::from))
        .context("no stack file given (--stack, OPTIMUS_STACK_FILE or stack-file)")?;
    let stack = load_stack(&stack_path)
        .with_context(|| format!("failed to load stack {}", stack_path.display()))?;
    info!(
        stack = %stack.name,
        resources = stack.resources.len(),
        pipelines = stack.pipelines.len(),
        "Loaded stack"
    );

    let state = AppState::new(&config.server, &config.provider, stack).await;

    if args.provision_on_start {
        if let Err(e) = state.stack.start_provision().await {
            error!(error = %e, "Failed to start provisioning");
        }
    }

    // Build router
    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    info!("Starting server on {}", config.server.listen);
    let listener = TcpListener::bind(&config.server.listen).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
