//! Ferrobot CLI — entry point.
//!
//! # Commands
//!
//! - `ferrobot agent [-m MESSAGE]` — chat (single-shot or REPL)
//! - `ferrobot gateway` — run all channels + the agent loop
//! - `ferrobot cron list|remove` — manage scheduled tasks

mod gateway;
mod helpers;
mod repl;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use ferrobot_agent::{AgentLoop, AgentSettings};
use ferrobot_core::bus::queue::MessageBus;
use ferrobot_core::config::{load_config, load_workspace_env, Config};
use ferrobot_cron::CronService;
use ferrobot_providers::create_provider;

// ─────────────────────────────────────────────
// CLI definition
// ─────────────────────────────────────────────

/// Ferrobot — multi-channel AI assistant in Rust
#[derive(Parser)]
#[command(name = "ferrobot", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the AI agent (single-shot or interactive REPL)
    Agent {
        /// Single message (non-interactive). Omit for REPL mode.
        #[arg(short, long)]
        message: Option<String>,

        /// Enable debug logging
        #[arg(long, default_value_t = false)]
        logs: bool,
    },

    /// Start the gateway (all channels + agent loop + cron)
    Gateway {
        /// Enable debug logging
        #[arg(long, default_value_t = false)]
        logs: bool,
    },

    /// Manage scheduled tasks
    Cron {
        #[command(subcommand)]
        action: CronCommands,
    },
}

#[derive(Subcommand)]
enum CronCommands {
    /// List scheduled jobs
    List {
        /// Include disabled jobs
        #[arg(long, default_value_t = false)]
        all: bool,
    },
    /// Remove a job by id
    Remove { id: String },
}

// ─────────────────────────────────────────────
// Entrypoint
// ─────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Agent { message, logs } => {
            init_logging(logs);
            run_agent(message).await
        }
        Commands::Gateway { logs } => {
            init_logging(logs);
            gateway::run().await
        }
        Commands::Cron { action } => {
            init_logging(false);
            run_cron(action).await
        }
    }
}

// ─────────────────────────────────────────────
// Agent command
// ─────────────────────────────────────────────

async fn run_agent(message: Option<String>) -> Result<()> {
    let config = load_config(None);
    let agent_loop = build_agent_loop(&config)?;

    match message {
        Some(msg) => {
            info!("processing single message");
            let response = agent_loop
                .process_direct(&msg)
                .await
                .context("agent processing failed")?;
            helpers::print_response(&response);
        }
        None => {
            repl::run(agent_loop).await?;
        }
    }

    Ok(())
}

/// Build a standalone `AgentLoop` (no channels, no cron) from config.
pub fn build_agent_loop(config: &Config) -> Result<AgentLoop> {
    let defaults = &config.agents.defaults;

    let workspace = helpers::expand_tilde(&defaults.workspace);
    std::fs::create_dir_all(&workspace)
        .with_context(|| format!("failed to create workspace: {}", workspace.display()))?;

    // User-placed keys in {workspace}/.env (platform env wins).
    load_workspace_env(&workspace);

    let providers_map = config.providers.to_map();
    let provider = create_provider(&defaults.model, &providers_map)?;

    let brave_key = if config.tools.web.search.api_key.is_empty() {
        None
    } else {
        Some(config.tools.web.search.api_key.clone())
    };

    let settings = AgentSettings {
        model: Some(defaults.model.clone()),
        max_iterations: defaults.max_tool_iterations as usize,
        max_tool_retries: defaults.max_tool_retries as usize,
        brave_api_key: brave_key,
        exec_config: config.tools.exec.clone(),
        restrict_to_workspace: config.tools.restrict_to_workspace,
        plan: defaults.plan.clone(),
        ..AgentSettings::default()
    };

    let bus = Arc::new(MessageBus::new(100));
    AgentLoop::new(bus, Arc::new(provider), workspace, settings, None, vec![])
}

// ─────────────────────────────────────────────
// Cron command
// ─────────────────────────────────────────────

async fn run_cron(action: CronCommands) -> Result<()> {
    let bus = Arc::new(MessageBus::new(10));
    let cron = CronService::new(bus, None);
    cron.load().await?;

    match action {
        CronCommands::List { all } => {
            let jobs = cron.list_jobs(all).await;
            if jobs.is_empty() {
                println!("No scheduled jobs.");
                return Ok(());
            }
            for job in jobs {
                let status = if job.enabled { "enabled" } else { "disabled" };
                println!(
                    "{}  {}  [{}]  {}",
                    job.id,
                    job.name,
                    status,
                    job.payload.message
                );
            }
        }
        CronCommands::Remove { id } => {
            if cron.remove_job(&id).await? {
                println!("Removed job {id}");
            } else {
                println!("Job {id} not found");
            }
        }
    }

    Ok(())
}

/// Initialize tracing/logging.
fn init_logging(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("ferrobot=debug,info")
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
