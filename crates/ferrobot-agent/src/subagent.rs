//! Background task delegation.
//!
//! The `spawn` tool hands work to the [`SubagentManager`], which runs each
//! task on a detached tokio task: a task-scoped system prompt, a reduced
//! toolbox (files, shell, web — deliberately no messaging, no nested
//! spawns, no in-place edits), and an ephemeral transcript that is thrown
//! away when the worker finishes.
//!
//! A finished worker publishes its report as a `system` inbound message
//! whose `chat_id` encodes the conversation that asked for it
//! (`"channel:chat_id"`); the main loop picks that up and folds the
//! result back into the right conversation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Result;
use tracing::{debug, error, info};

use ferrobot_core::bus::queue::MessageBus;
use ferrobot_core::bus::types::InboundMessage;
use ferrobot_core::config::schema::ExecToolConfig;
use ferrobot_core::types::Message;
use ferrobot_providers::traits::{LlmProvider, LlmRequestConfig};

use crate::tools::filesystem::{ListDirTool, ReadFileTool, WriteFileTool};
use crate::tools::registry::ToolRegistry;
use crate::tools::shell::ExecTool;
use crate::tools::web::{WebFetchTool, WebSearchTool};

/// LM ↔ tool turns a worker may take before it is cut off.
const WORKER_MAX_TURNS: usize = 15;

/// Display labels derived from the task text are clipped to this length.
const LABEL_MAX_CHARS: usize = 32;

// ─────────────────────────────────────────────
// Origin + task records
// ─────────────────────────────────────────────

/// The conversation a background task came from — and where its report
/// routes back to.
#[derive(Clone, Debug)]
pub struct Origin {
    pub channel: String,
    pub chat_id: String,
}

impl Origin {
    pub fn new(channel: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
        }
    }

    /// The `chat_id` a system announce carries: `"channel:chat_id"`.
    pub fn encode(&self) -> String {
        format!("{}:{}", self.channel, self.chat_id)
    }
}

/// A task currently running in the background.
#[derive(Clone, Debug)]
pub struct BackgroundTask {
    /// Short random identifier (8 hex chars).
    pub id: String,
    /// Display label, either caller-supplied or clipped from the task.
    pub label: String,
    /// The full task text handed to the worker.
    pub prompt: String,
    /// Conversation the report routes back to.
    pub origin: Origin,
}

/// First line of the task text, clipped, as a fallback display label.
fn short_label(prompt: &str) -> String {
    let first_line = prompt.lines().next().unwrap_or(prompt);
    if first_line.chars().count() <= LABEL_MAX_CHARS {
        return first_line.to_string();
    }
    let clipped: String = first_line.chars().take(LABEL_MAX_CHARS).collect();
    format!("{clipped}...")
}

fn new_task_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

// ─────────────────────────────────────────────
// SubagentManager
// ─────────────────────────────────────────────

/// Owns the lifecycle of background workers.
///
/// Created once by the agent loop and shared via `Arc`; the `spawn` tool
/// delegates here.
pub struct SubagentManager {
    provider: Arc<dyn LlmProvider>,
    workspace: PathBuf,
    bus: Arc<MessageBus>,
    model: String,
    brave_api_key: Option<String>,
    exec_config: ExecToolConfig,
    restrict_to_workspace: bool,
    request_config: LlmRequestConfig,
    /// Tasks still in flight, by id.
    running: Mutex<HashMap<String, BackgroundTask>>,
}

impl SubagentManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        workspace: PathBuf,
        bus: Arc<MessageBus>,
        model: String,
        brave_api_key: Option<String>,
        exec_config: ExecToolConfig,
        restrict_to_workspace: bool,
        request_config: LlmRequestConfig,
    ) -> Self {
        Self {
            provider,
            workspace,
            bus,
            model,
            brave_api_key,
            exec_config,
            restrict_to_workspace,
            request_config,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Kick off a background task and return an immediate acknowledgement
    /// for the LM. The work itself runs detached.
    pub async fn spawn(
        self: &Arc<Self>,
        prompt: String,
        label: Option<String>,
        origin: Origin,
    ) -> String {
        let task = BackgroundTask {
            id: new_task_id(),
            label: label.unwrap_or_else(|| short_label(&prompt)),
            prompt,
            origin,
        };

        self.running
            .lock()
            .unwrap()
            .insert(task.id.clone(), task.clone());

        let manager = Arc::clone(self);
        let ack = format!(
            "Started background task \"{}\" (id {}). The result will arrive \
             in this conversation when it's done.",
            task.label, task.id
        );

        tokio::spawn(async move {
            let report = match manager.run_worker(&task).await {
                Ok(text) => text,
                Err(e) => {
                    error!(task = %task.id, error = %e, "background task failed");
                    format!("The task failed: {e}")
                }
            };
            manager.publish_report(&task, &report).await;
            manager.running.lock().unwrap().remove(&task.id);
        });

        ack
    }

    /// Drive one worker to completion: LM calls interleaved with tool
    /// execution over an ephemeral transcript.
    async fn run_worker(&self, task: &BackgroundTask) -> Result<String> {
        info!(task = %task.id, label = %task.label, "background task starting");

        let tools = self.worker_toolbox();
        let definitions = tools.get_definitions();

        let mut transcript = vec![
            Message::system(self.worker_prompt(&task.prompt)),
            Message::user(&task.prompt),
        ];

        for turn in 0..WORKER_MAX_TURNS {
            let reply = self
                .provider
                .chat(&transcript, Some(&definitions), &self.model, &self.request_config)
                .await?;

            if !reply.has_tool_calls() {
                let report = reply
                    .content
                    .unwrap_or_else(|| "The task finished without producing a report.".into());
                info!(task = %task.id, turns = turn + 1, "background task finished");
                return Ok(report);
            }

            let calls = reply.tool_calls;
            transcript.push(Message::assistant_tool_calls(calls.clone()));

            for call in &calls {
                let args: HashMap<String, serde_json::Value> =
                    serde_json::from_str(&call.function.arguments).unwrap_or_default();
                debug!(task = %task.id, tool = %call.function.name, "worker tool call");
                let output = tools.execute(&call.function.name, args).await;
                transcript.push(Message::tool_result(&call.id, output));
            }
        }

        Ok(
            "The task hit its turn limit before finishing; partial results may \
             be in the workspace."
                .into(),
        )
    }

    /// The reduced toolbox workers get. No message tool (workers don't
    /// talk to users), no spawn (no nested workers), no edit_file
    /// (workers rewrite whole files).
    fn worker_toolbox(&self) -> ToolRegistry {
        let scope = if self.restrict_to_workspace {
            Some(self.workspace.clone())
        } else {
            None
        };

        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(ReadFileTool::new(scope.clone())));
        tools.register(Arc::new(WriteFileTool::new(scope.clone())));
        tools.register(Arc::new(ListDirTool::new(scope)));
        tools.register(Arc::new(ExecTool::new(
            self.workspace.clone(),
            Some(self.exec_config.timeout),
            self.restrict_to_workspace,
        )));
        tools.register(Arc::new(WebSearchTool::new(self.brave_api_key.clone())));
        tools.register(Arc::new(WebFetchTool::new()));
        tools
    }

    /// System prompt for a worker: the task, what it may do, and the fact
    /// that its final answer IS the report.
    fn worker_prompt(&self, prompt: &str) -> String {
        format!(
            "You are a background worker for a chat assistant. You were handed \
             exactly one task; the conversation that created you is not visible \
             to you.\n\n\
             Task:\n{prompt}\n\n\
             Ground rules:\n\
             - Do this task and nothing else, then stop.\n\
             - Your final answer becomes the report the assistant relays to \
             the user, so make it self-contained.\n\
             - You may read and write files under {workspace}, run shell \
             commands, and search or fetch the web.\n\
             - You cannot message anyone, start further background tasks, or \
             patch files in place; rewrite whole files instead.",
            workspace = self.workspace.display()
        )
    }

    /// Publish a worker's report onto the bus as a system announce.
    async fn publish_report(&self, task: &BackgroundTask, report: &str) {
        let content = format!(
            "A background task finished.\n\
             Label: {label}\n\n\
             Report:\n{report}\n\n\
             Relay the outcome to the user in a sentence or two; don't \
             mention task ids.",
            label = task.label
        );

        let announce = InboundMessage::new("system", "subagent", task.origin.encode(), content);

        info!(task = %task.id, origin = %task.origin.encode(), "publishing task report");
        if let Err(e) = self.bus.publish_inbound(announce).await {
            error!(task = %task.id, error = %e, "failed to publish task report");
        }
    }

    /// Snapshot of tasks still in flight.
    pub fn active(&self) -> Vec<BackgroundTask> {
        self.running.lock().unwrap().values().cloned().collect()
    }

    /// Number of tasks still in flight.
    pub fn active_count(&self) -> usize {
        self.running.lock().unwrap().len()
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
