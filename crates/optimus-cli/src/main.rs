//! Optimus CLI tool.

use clap::{Parser, Subcommand, ValueEnum};
use optimus_provisioner::SignalStatus;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "optimus")]
#[command(about = "Optimus provisioning CLI", long_about = None)]
struct Cli {
    /// API server URL
    #[arg(long, env = "OPTIMUS_API_URL", default_value = "http://localhost:8080")]
    api_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a stack document
    Validate {
        /// Path to the stack file
        #[arg(default_value = "optimus.kdl")]
        path: String,
    },
    /// Print the resolved creation order of a stack
    Plan {
        /// Path to the stack file
        #[arg(default_value = "optimus.kdl")]
        path: String,
    },
    /// Provision a stack in-process against the local provider
    DryRun {
        /// Path to the stack file
        #[arg(default_value = "optimus.kdl")]
        path: String,
        /// Node the provider should refuse to create
        #[arg(long = "fail")]
        fail_nodes: Vec<String>,
        /// Signal gate to answer with FAILURE
        #[arg(long = "fail-signal")]
        fail_signals: Vec<String>,
    },
    /// Provision the server's stack
    Provision {
        /// Wait until provisioning ends
        #[arg(short, long)]
        wait: bool,
    },
    /// Show stack and node status
    Status,
    /// Show stack outputs
    Outputs,
    /// Destroy the server's stack
    Teardown,
    /// Report a bootstrap signal to a callback URL
    Signal {
        /// Callback URL handed to the instance
        url: String,
        #[arg(long, value_enum, default_value = "success")]
        status: SignalArg,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long)]
        unique_id: Option<String>,
        #[arg(long)]
        data: Option<String>,
    },
    /// Manage pipelines
    Pipelines {
        #[command(subcommand)]
        command: PipelineCommands,
    },
    /// Inspect pipeline executions
    Executions {
        #[command(subcommand)]
        command: ExecutionCommands,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SignalArg {
    Success,
    Failure,
}

impl From<SignalArg> for SignalStatus {
    fn from(arg: SignalArg) -> Self {
        match arg {
            SignalArg::Success => SignalStatus::Success,
            SignalArg::Failure => SignalStatus::Failure,
        }
    }
}

#[derive(Subcommand)]
enum PipelineCommands {
    /// List all pipelines
    List,
    /// Trigger a pipeline execution
    Trigger {
        /// Pipeline name
        pipeline: String,
        /// Branch to build
        #[arg(long)]
        branch: Option<String>,
        /// Commit to build
        #[arg(long)]
        commit: Option<String>,
    },
}

#[derive(Subcommand)]
enum ExecutionCommands {
    /// List recent executions of a pipeline
    List {
        /// Pipeline name
        pipeline: String,
        /// Maximum number of executions to show
        #[arg(long, default_value = "10")]
        limit: usize,
    },
    /// Show execution details
    Show {
        /// Execution ID
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
        Commands::Plan { path } => {
            commands::plan(&path)?;
        }
        Commands::DryRun {
            path,
            fail_nodes,
            fail_signals,
        } => {
            commands::dry_run::run(&path, fail_nodes, fail_signals).await?;
        }
        Commands::Provision { wait } => {
            commands::stack::provision(&cli.api_url, wait).await?;
        }
        Commands::Status => {
            commands::stack::status(&cli.api_url).await?;
        }
        Commands::Outputs => {
            commands::stack::outputs(&cli.api_url).await?;
        }
        Commands::Teardown => {
            commands::stack::teardown(&cli.api_url).await?;
        }
        Commands::Signal {
            url,
            status,
            reason,
            unique_id,
            data,
        } => {
            commands::signal::send(&url, status.into(), reason, unique_id, data).await?;
        }
        Commands::Pipelines { command } => match command {
            PipelineCommands::List => {
                commands::pipelines::list(&cli.api_url).await?;
            }
            PipelineCommands::Trigger {
                pipeline,
                branch,
                commit,
            } => {
                commands::pipelines::trigger(&cli.api_url, &pipeline, branch, commit).await?;
            }
        },
        Commands::Executions { command } => match command {
            ExecutionCommands::List { pipeline, limit } => {
                commands::executions::list(&cli.api_url, &pipeline, limit).await?;
            }
            ExecutionCommands::Show { id } => {
                commands::executions::show(&cli.api_url, &id).await?;
            }
        },
    }

    Ok(())
}
