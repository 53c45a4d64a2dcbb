//! Gateway command — wires the bus, agent loop, channels, and cron.
//!
//! Startup sequence:
//! 1. Load config, resolve workspace, merge workspace `.env`
//! 2. Create the message bus
//! 3. Create the cron service (bus producer) and browser tool
//! 4. Create the agent loop with the full tool set
//! 5. Register enabled channels with the channel manager
//! 6. Run everything under `tokio::select!`; Ctrl+C shuts down gracefully

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use ferrobot_agent::{AgentLoop, AgentSettings};
use ferrobot_browser::{solver_from_config, BrowserTool};
use ferrobot_channels::slack::SlackChannel;
use ferrobot_channels::teams::TeamsChannel;
use ferrobot_channels::telegram::TelegramChannel;
use ferrobot_channels::whatsapp::WhatsAppChannel;
use ferrobot_channels::ChannelManager;
use ferrobot_core::bus::queue::MessageBus;
use ferrobot_core::config::{load_config, load_workspace_env};
use ferrobot_core::tool::Tool;
use ferrobot_cron::CronService;
use ferrobot_providers::{create_provider, GroqTranscriber, TranscriptionProvider};

use crate::helpers;

/// Run the gateway — channels + agent loop + cron.
pub async fn run() -> Result<()> {
    println!();
    helpers::print_banner();
    println!("  Mode: Gateway");
    println!();

    // 1. Config + workspace
    let config = load_config(None);
    let defaults = &config.agents.defaults;

    let workspace = helpers::expand_tilde(&defaults.workspace);
    std::fs::create_dir_all(&workspace)
        .with_context(|| format!("failed to create workspace: {}", workspace.display()))?;
    load_workspace_env(&workspace);

    // 2. Message bus (shared by agent, channels, cron)
    let bus = Arc::new(MessageBus::new(100));

    // 3. Provider
    let model = defaults.model.clone();
    let providers_map = config.providers.to_map();
    let provider = create_provider(&model, &providers_map)?;

    let brave_key = if config.tools.web.search.api_key.is_empty() {
        std::env::var("BRAVE_API_KEY").ok().filter(|s| !s.is_empty())
    } else {
        Some(config.tools.web.search.api_key.clone())
    };

    // 4. Cron service (its firings re-enter through the bus)
    let cron_service = Arc::new(CronService::new(bus.clone(), None));
    if let Err(e) = cron_service.load().await {
        tracing::warn!(error = %e, "failed to pre-load cron store");
    }
    let cron_jobs = cron_service.list_jobs(true).await;

    // 5. Browser tool (optional)
    let mut extra_tools: Vec<Arc<dyn Tool>> = Vec::new();
    if config.tools.browser.enabled {
        let solver = solver_from_config(
            &config.tools.browser.captcha_provider,
            &config.tools.browser.captcha_api_key,
        );
        if solver.is_some() {
            info!(
                provider = %config.tools.browser.captcha_provider,
                "captcha solving enabled"
            );
        }
        extra_tools.push(Arc::new(BrowserTool::new(
            workspace.clone(),
            solver,
            config.tools.browser.proxy_url.clone(),
        )));
    }

    // 6. Agent loop
    let settings = AgentSettings {
        model: Some(model.clone()),
        max_iterations: defaults.max_tool_iterations as usize,
        max_tool_retries: defaults.max_tool_retries as usize,
        brave_api_key: brave_key,
        exec_config: config.tools.exec.clone(),
        restrict_to_workspace: config.tools.restrict_to_workspace,
        plan: defaults.plan.clone(),
        ..AgentSettings::default()
    };

    let agent_loop = Arc::new(AgentLoop::new(
        bus.clone(),
        Arc::new(provider),
        workspace.clone(),
        settings,
        Some(cron_service.clone()),
        extra_tools,
    )?);

    // 7. Channels
    let mut channel_manager = ChannelManager::new(bus.clone());

    // Telegram
    {
        let tg = &config.channels.telegram;
        if !tg.token.is_empty() {
            let mut telegram = TelegramChannel::new(
                tg.token.clone(),
                bus.clone(),
                tg.allowed_users.clone(),
                Some(workspace.clone()),
            );

            // Voice transcription hook
            if config.transcription.enabled {
                let key = if !config.transcription.api_key.is_empty() {
                    config.transcription.api_key.clone()
                } else {
                    config.providers.groq.api_key.clone()
                };
                let transcriber = Arc::new(GroqTranscriber::new(&key));
                if transcriber.is_configured() {
                    let t = transcriber.clone();
                    telegram = telegram.with_transcriber(Arc::new(move |path: String| {
                        let t = t.clone();
                        Box::pin(async move { t.transcribe(std::path::Path::new(&path)).await })
                    }));
                    info!("voice transcription enabled");
                }
            }

            channel_manager.register(Arc::new(telegram)).await;
        }
    }

    // Slack
    {
        let sl = &config.channels.slack;
        if !sl.bot_token.is_empty() && !sl.app_token.is_empty() {
            let slack = SlackChannel::new(sl.clone(), bus.clone(), Some(workspace.clone()));
            channel_manager.register(Arc::new(slack)).await;
        }
    }

    // Teams
    {
        let tm = &config.channels.teams;
        if !tm.app_id.is_empty() && !tm.app_password.is_empty() {
            let teams = TeamsChannel::new(tm.clone(), bus.clone());
            channel_manager.register(Arc::new(teams)).await;
        }
    }

    // WhatsApp
    {
        let wa = &config.channels.whatsapp;
        if !wa.bridge_url.is_empty() {
            let whatsapp = WhatsAppChannel::new(
                wa.bridge_url.clone(),
                bus.clone(),
                wa.allowed_users.clone(),
                Some(workspace.clone()),
            );
            channel_manager.register(Arc::new(whatsapp)).await;
        }
    }

    info!(
        model = %model,
        workspace = %workspace.display(),
        channels = ?channel_manager.channel_names(),
        "gateway starting"
    );

    println!("  Model:     {model}");
    println!("  Workspace: {}", workspace.display());
    println!("  Channels:  {} registered", channel_manager.len());
    if !cron_jobs.is_empty() {
        let enabled = cron_jobs.iter().filter(|j| j.enabled).count();
        println!("  Cron:      {} jobs ({} enabled)", cron_jobs.len(), enabled);
    }
    println!();

    if channel_manager.is_empty() {
        println!("  No channels registered. The agent loop will run but");
        println!("  only process messages from the internal bus.");
        println!("  Configure channels in ~/.ferrobot/config.json");
        println!();
    }

    println!("  Ctrl+C to stop");
    println!();

    // 8. Run everything; Ctrl+C triggers graceful shutdown.
    tokio::select! {
        _ = agent_loop.run() => {
            info!("agent loop exited");
        }
        result = channel_manager.start_all() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "channel manager error");
            }
        }
        result = cron_service.start() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "cron service error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            println!();
            println!("  Shutting down...");
            info!("received Ctrl+C, shutting down");
            agent_loop.stop();
            cron_service.stop().await;
            channel_manager.stop_all().await;
        }
    }

    println!("  Gateway stopped. Goodbye!");
    Ok(())
}
