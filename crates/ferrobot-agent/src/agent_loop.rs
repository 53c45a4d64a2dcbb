//! Agent loop — the LM ↔ tool-calling engine.
//!
//! Drains inbound messages from the bus, gates them (plan, credits), builds
//! context, drives the LM/tool iteration, persists the turn, and publishes
//! exactly one outbound reply per inbound message.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, error, info};

use ferrobot_core::bus::queue::MessageBus;
use ferrobot_core::bus::types::{InboundMessage, OutboundMessage};
use ferrobot_core::config::schema::ExecToolConfig;
use ferrobot_core::session::SessionManager;
use ferrobot_core::tool::Tool;
use ferrobot_core::types::{Message, ToolCall};
use ferrobot_cron::CronService;
use ferrobot_providers::traits::{LlmProvider, LlmRequestConfig};

use crate::context::ContextBuilder;
use crate::credit::{self, CreditVerdict};
use crate::subagent::SubagentManager;
use crate::tools::cron::CronTool;
use crate::tools::filesystem::{EditFileTool, ListDirTool, ReadFileTool, WriteFileTool};
use crate::tools::message::{MessageTool, SendCallback};
use crate::tools::registry::ToolRegistry;
use crate::tools::shell::ExecTool;
use crate::tools::spawn::SpawnTool;
use crate::tools::web::{WebFetchTool, WebSearchTool};

/// Poll interval for the inbound queue; interlocks with the stop flag.
const INBOUND_POLL: Duration = Duration::from_secs(1);

// ─────────────────────────────────────────────
// Settings
// ─────────────────────────────────────────────

/// Tunable knobs for the agent loop.
#[derive(Clone, Debug)]
pub struct AgentSettings {
    /// Model override (defaults to the provider's default model).
    pub model: Option<String>,
    /// Max LM ↔ tool iterations per message.
    pub max_iterations: usize,
    /// Consecutive tool failures within one turn before it aborts.
    pub max_tool_retries: usize,
    /// Per-call LM request config (temperature, max_tokens).
    pub request_config: LlmRequestConfig,
    /// Brave Search API key for the web_search tool.
    pub brave_api_key: Option<String>,
    /// Exec tool config.
    pub exec_config: ExecToolConfig,
    /// Restrict filesystem/exec tools to the workspace.
    pub restrict_to_workspace: bool,
    /// Billing plan; `"free"` replies with the upgrade teaser, no LM call.
    pub plan: String,
    /// Platform base URL for the credit precheck.
    pub platform_url: Option<String>,
    /// Platform user id for the credit precheck.
    pub credit_user_id: Option<String>,
    /// Agent display name for the system prompt.
    pub agent_name: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            model: None,
            max_iterations: 20,
            max_tool_retries: 3,
            request_config: LlmRequestConfig::default(),
            brave_api_key: None,
            exec_config: ExecToolConfig::default(),
            restrict_to_workspace: false,
            plan: "pro".into(),
            platform_url: std::env::var("PLATFORM_URL").ok().filter(|s| !s.is_empty()),
            credit_user_id: std::env::var("CREDIT_USER_ID").ok().filter(|s| !s.is_empty()),
            agent_name: "Ferrobot".into(),
        }
    }
}

impl AgentSettings {
    fn billing_url(&self) -> String {
        match &self.platform_url {
            Some(url) => format!("{}/billing", url.trim_end_matches('/')),
            None => "https://ferrobot.app/billing".into(),
        }
    }

    fn topup_url(&self) -> String {
        match &self.platform_url {
            Some(url) => format!("{}/topup", url.trim_end_matches('/')),
            None => "https://ferrobot.app/topup".into(),
        }
    }
}

/// The exact `[USAGE]` line emitted after a terminal LM turn.
fn format_usage_line(prompt_tokens: u32, completion_tokens: u32, model: &str) -> String {
    format!(
        "[USAGE] {{\"prompt_tokens\":{prompt_tokens},\"completion_tokens\":{completion_tokens},\"model\":\"{model}\"}}"
    )
}

// ─────────────────────────────────────────────
// AgentLoop
// ─────────────────────────────────────────────

/// The main agent loop: polls the message bus, calls the LM, dispatches
/// tools, and replies.
pub struct AgentLoop {
    bus: Arc<MessageBus>,
    provider: Arc<dyn LlmProvider>,
    #[allow(dead_code)]
    workspace: PathBuf,
    model: String,
    settings: AgentSettings,
    tools: ToolRegistry,
    context: ContextBuilder,
    sessions: SessionManager,
    message_tool: Arc<MessageTool>,
    spawn_tool: Arc<SpawnTool>,
    cron_tool: Option<Arc<CronTool>>,
    subagent_manager: Arc<SubagentManager>,
    stopped: AtomicBool,
}

impl AgentLoop {
    /// Create a new agent loop with the default tool set.
    ///
    /// `extra_tools` are registered on top (e.g. the browser tool).
    pub fn new(
        bus: Arc<MessageBus>,
        provider: Arc<dyn LlmProvider>,
        workspace: PathBuf,
        settings: AgentSettings,
        cron_service: Option<Arc<CronService>>,
        extra_tools: Vec<Arc<dyn Tool>>,
    ) -> Result<Self> {
        let model = settings
            .model
            .clone()
            .unwrap_or_else(|| provider.default_model().to_string());

        let sessions = SessionManager::new(&workspace)?;
        let context = ContextBuilder::new(&workspace, &settings.agent_name);

        let mut tools = ToolRegistry::new();
        let allowed_dir = if settings.restrict_to_workspace {
            Some(workspace.clone())
        } else {
            None
        };

        tools.register(Arc::new(ReadFileTool::new(allowed_dir.clone())));
        tools.register(Arc::new(WriteFileTool::new(allowed_dir.clone())));
        tools.register(Arc::new(EditFileTool::new(allowed_dir.clone())));
        tools.register(Arc::new(ListDirTool::new(allowed_dir)));
        tools.register(Arc::new(ExecTool::new(
            workspace.clone(),
            Some(settings.exec_config.timeout),
            settings.restrict_to_workspace,
        )));
        tools.register(Arc::new(WebSearchTool::new(settings.brave_api_key.clone())));
        tools.register(Arc::new(WebFetchTool::new()));

        // Message tool publishes straight onto the outbound bus.
        let send_bus = bus.clone();
        let send_callback: SendCallback = Arc::new(move |msg: OutboundMessage| {
            let bus = send_bus.clone();
            Box::pin(async move {
                bus.publish_outbound(msg).await;
                Ok(())
            })
        });
        let message_tool = Arc::new(MessageTool::new(Some(send_callback)));
        tools.register(message_tool.clone());

        let subagent_manager = Arc::new(SubagentManager::new(
            provider.clone(),
            workspace.clone(),
            bus.clone(),
            model.clone(),
            settings.brave_api_key.clone(),
            settings.exec_config.clone(),
            settings.restrict_to_workspace,
            settings.request_config.clone(),
        ));

        let spawn_tool = Arc::new(SpawnTool::new(subagent_manager.clone()));
        tools.register(spawn_tool.clone());

        let cron_tool = cron_service.map(|svc| {
            let tool = Arc::new(CronTool::new(svc));
            tools.register(tool.clone());
            tool
        });

        for tool in extra_tools {
            tools.register(tool);
        }

        info!(
            model = %model,
            tools = tools.len(),
            max_iterations = settings.max_iterations,
            "agent loop initialized"
        );

        Ok(Self {
            bus,
            provider,
            workspace,
            model,
            settings,
            tools,
            context,
            sessions,
            message_tool,
            spawn_tool,
            cron_tool,
            subagent_manager,
            stopped: AtomicBool::new(false),
        })
    }

    /// Run the event loop: poll inbound messages and process them.
    ///
    /// Runs until `stop()` is called. Every inbound user message produces
    /// exactly one outbound reply (the error reply on failure).
    pub async fn run(&self) {
        info!("agent loop started, waiting for messages");
        while !self.stopped.load(Ordering::SeqCst) {
            let Some(msg) = self.bus.consume_inbound(INBOUND_POLL).await else {
                continue;
            };

            let session_key = msg.session_key();
            debug!(session_key = %session_key, channel = %msg.channel, "received message");

            match self.process_message(&msg).await {
                Ok(response) => {
                    self.bus.publish_outbound(response).await;
                }
                Err(e) => {
                    error!(error = %e, session_key = %session_key, "message processing error");
                    let err_msg = OutboundMessage::new(
                        &msg.channel,
                        &msg.chat_id,
                        format!("Sorry, I encountered an error: {e}"),
                    );
                    self.bus.publish_outbound(err_msg).await;
                }
            }
        }
        info!("agent loop stopped");
    }

    /// Signal the loop to exit after its current poll.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Process a single inbound message into an outbound response.
    pub async fn process_message(&self, msg: &InboundMessage) -> Result<OutboundMessage> {
        // Sub-agent / cron announces route back through their origin.
        if msg.channel == "system" {
            return self.process_system_message(msg).await;
        }

        info!(channel = %msg.channel, sender = %msg.sender_id, "processing message");

        let is_internal = msg.is_internal();

        // Free tier: the bot stays responsive but only sends the upgrade
        // teaser; no LM call.
        if !is_internal && self.settings.plan == "free" {
            return Ok(OutboundMessage::new(
                &msg.channel,
                &msg.chat_id,
                format!(
                    "Free trial is currently paused due to high demand. \
                     Activate a plan to get $10 in free credits and unlock \
                     unlimited AI messages + 24/7 hosting. Upgrade here: {}",
                    self.settings.billing_url()
                ),
            ));
        }

        // Credit precheck — fail-closed to protect credits.
        if !is_internal {
            if let (Some(platform_url), Some(user_id)) = (
                self.settings.platform_url.as_deref(),
                self.settings.credit_user_id.as_deref(),
            ) {
                match credit::check(platform_url, user_id).await {
                    CreditVerdict::Ok => {}
                    CreditVerdict::Exhausted => {
                        return Ok(OutboundMessage::new(
                            &msg.channel,
                            &msg.chat_id,
                            format!(
                                "Your credits have been used up. Please top up your \
                                 account to continue chatting: {}",
                                self.settings.topup_url()
                            ),
                        ));
                    }
                    CreditVerdict::Unverified => {
                        return Ok(OutboundMessage::new(
                            &msg.channel,
                            &msg.chat_id,
                            "Unable to verify your credit balance. Please try again in a moment.",
                        ));
                    }
                }
            }
        }

        let session_key = msg.session_key();

        // Point the context-aware tools at this conversation.
        self.set_tool_context(&msg.channel, &msg.chat_id).await;

        let history = self.sessions.get_history(&session_key);
        let media_paths: Vec<String> = msg.media.iter().map(|m| m.path.clone()).collect();
        let mut messages = self.context.messages_for_turn(
            &history,
            &msg.content,
            &media_paths,
            &msg.channel,
            &msg.chat_id,
        );

        let (final_content, prompt_tokens, completion_tokens) =
            self.run_iterations(&mut messages).await?;

        let content = final_content
            .unwrap_or_else(|| "I've completed processing but have no response to give.".into());

        // Persist the turn before the reply goes out.
        self.sessions.add_message(&session_key, Message::user(&msg.content));
        self.sessions.add_message(&session_key, Message::assistant(&content));

        self.emit_usage(prompt_tokens, completion_tokens);

        Ok(OutboundMessage::new(&msg.channel, &msg.chat_id, &content))
    }

    /// Process a system message (sub-agent announce or cron firing).
    ///
    /// `chat_id` carries `"origin_channel:origin_chat_id"`; the reply is
    /// routed back to that conversation using its session. No plan or
    /// credit gating applies.
    async fn process_system_message(&self, msg: &InboundMessage) -> Result<OutboundMessage> {
        info!(sender = %msg.sender_id, chat_id = %msg.chat_id, "processing system message");

        let (origin_channel, origin_chat_id) = match msg.chat_id.split_once(':') {
            Some((ch, cid)) => (ch.to_string(), cid.to_string()),
            None => ("cli".to_string(), msg.chat_id.clone()),
        };

        let session_key = format!("{origin_channel}:{origin_chat_id}");

        self.set_tool_context(&origin_channel, &origin_chat_id).await;

        let history = self.sessions.get_history(&session_key);
        let mut messages =
            self.context
                .messages_for_turn(&history, &msg.content, &[], &origin_channel, &origin_chat_id);

        let (final_content, prompt_tokens, completion_tokens) =
            self.run_iterations(&mut messages).await?;

        let content = final_content.unwrap_or_else(|| "Background task completed.".into());

        self.sessions.add_message(
            &session_key,
            Message::user(format!("[System: {}] {}", msg.sender_id, msg.content)),
        );
        self.sessions.add_message(&session_key, Message::assistant(&content));

        self.emit_usage(prompt_tokens, completion_tokens);

        Ok(OutboundMessage::new(&origin_channel, &origin_chat_id, &content))
    }

    /// The LM ↔ tool iteration shared by the user and system paths.
    ///
    /// Tool results are appended in the same order as the calls in the
    /// preceding assistant message. A turn-level counter tracks consecutive
    /// tool failures (results starting with `"Error:"`); it resets on any
    /// success and aborts the turn at `max_tool_retries`.
    async fn run_iterations(
        &self,
        messages: &mut Vec<Message>,
    ) -> Result<(Option<String>, u32, u32)> {
        let tool_defs = self.tools.get_definitions();
        let mut final_content: Option<String> = None;
        let mut prompt_tokens: u32 = 0;
        let mut completion_tokens: u32 = 0;
        let mut sequential_failures: usize = 0;

        for iteration in 0..self.settings.max_iterations {
            debug!(iteration = iteration, "LM call");

            let response = self
                .provider
                .chat(messages, Some(&tool_defs), &self.model, &self.settings.request_config)
                .await?;

            if let Some(usage) = &response.usage {
                prompt_tokens += usage.prompt_tokens;
                completion_tokens += usage.completion_tokens;
            }

            if response.has_tool_calls() {
                let tool_calls: Vec<ToolCall> = response.tool_calls.clone();
                ContextBuilder::push_assistant(
                    messages,
                    response.content.clone(),
                    tool_calls.clone(),
                );

                for tc in &tool_calls {
                    let params: HashMap<String, serde_json::Value> =
                        serde_json::from_str(&tc.function.arguments).unwrap_or_default();

                    info!(tool = %tc.function.name, iteration = iteration, "executing tool call");
                    let result = self.tools.execute(&tc.function.name, params).await;

                    if result.starts_with("Error:") {
                        sequential_failures += 1;
                        debug!(
                            tool = %tc.function.name,
                            failures = sequential_failures,
                            "tool call failed"
                        );
                    } else {
                        sequential_failures = 0;
                    }

                    ContextBuilder::push_tool_result(messages, &tc.id, &result);

                    // Stop the turn rather than letting the LM retry the
                    // same failing call until max_iterations.
                    if sequential_failures >= self.settings.max_tool_retries {
                        final_content = Some(format!(
                            "I've encountered repeated errors while trying to complete \
                             your request. The last error was: {result}. Please \
                             double-check the requirements or provide more details so \
                             I can assist better."
                        ));
                        break;
                    }
                }

                if final_content.is_some() {
                    break;
                }
            } else {
                final_content = response.content;
                break;
            }
        }

        Ok((final_content, prompt_tokens, completion_tokens))
    }

    async fn set_tool_context(&self, channel: &str, chat_id: &str) {
        self.message_tool.set_context(channel, chat_id).await;
        self.spawn_tool.set_context(channel, chat_id).await;
        if let Some(cron_tool) = &self.cron_tool {
            cron_tool.set_context(channel, chat_id).await;
        }
    }

    /// Emit the usage report line for platform credit tracking.
    ///
    /// Written only when at least one counter is non-zero.
    fn emit_usage(&self, prompt_tokens: u32, completion_tokens: u32) {
        if prompt_tokens > 0 || completion_tokens > 0 {
            println!("{}", format_usage_line(prompt_tokens, completion_tokens, &self.model));
            let _ = std::io::stdout().flush();
        }
    }

    /// Direct processing mode (CLI and cron entry point).
    ///
    /// Wraps text into an `InboundMessage` and processes it synchronously.
    pub async fn process_direct(&self, text: &str) -> Result<String> {
        let msg = InboundMessage::new("cli", "user", "direct", text);
        let response = self.process_message(&msg).await?;
        Ok(response.content)
    }

    /// The tool registry (for inspection in tests and the CLI).
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// The model name in use.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// The sub-agent manager.
    pub fn subagents(&self) -> &Arc<SubagentManager> {
        &self.subagent_manager
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ferrobot_core::types::{LlmResponse, ToolDefinition, UsageInfo};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// A mock LM provider returning canned responses, recording each call.
    struct MockProvider {
        responses: Mutex<Vec<LlmResponse>>,
        calls: AtomicUsize,
        seen_messages: Mutex<Vec<Vec<Message>>>,
    }

    impl MockProvider {
        fn new(responses: Vec<LlmResponse>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: AtomicUsize::new(0),
                seen_messages: Mutex::new(Vec::new()),
            }
        }

        fn simple(text: &str) -> Self {
            Self::new(vec![LlmResponse {
                content: Some(text.into()),
                ..Default::default()
            }])
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LlmProvider for MockProvider {
        async fn chat(
            &self,
            messages: &[Message],
            _tools: Option<&[ToolDefinition]>,
            _model: &str,
            _config: &LlmRequestConfig,
        ) -> anyhow::Result<LlmResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_messages.lock().unwrap().push(messages.to_vec());

            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(LlmResponse {
                    content: Some("(no more responses)".into()),
                    ..Default::default()
                })
            } else {
                Ok(responses.remove(0))
            }
        }

        fn default_model(&self) -> &str {
            "mock-model"
        }

        fn display_name(&self) -> &str {
            "MockProvider"
        }
    }

    /// A tool that always fails — used to exercise the retry cap.
    struct AlwaysFailTool;

    #[async_trait]
    impl Tool for AlwaysFailTool {
        fn name(&self) -> &str {
            "always_fail"
        }
        fn description(&self) -> &str {
            "Fails every time"
        }
        fn parameters(&self) -> serde_json::Value {
            json!({"type": "object", "properties": {}, "required": []})
        }
        async fn execute(
            &self,
            _params: HashMap<String, serde_json::Value>,
        ) -> anyhow::Result<String> {
            anyhow::bail!("nope")
        }
    }

    fn make_loop(
        provider: Arc<MockProvider>,
        settings: AgentSettings,
        extra_tools: Vec<Arc<dyn Tool>>,
    ) -> (AgentLoop, Arc<MessageBus>, tempfile::TempDir) {
        let bus = Arc::new(MessageBus::new(32));
        let dir = tempfile::tempdir().unwrap();
        let agent = AgentLoop::new(
            bus.clone(),
            provider,
            dir.path().to_path_buf(),
            settings,
            None,
            extra_tools,
        )
        .unwrap();
        (agent, bus, dir)
    }

    fn default_settings() -> AgentSettings {
        AgentSettings {
            platform_url: None,
            credit_user_id: None,
            ..AgentSettings::default()
        }
    }

    // ── Scenario: free plan gate ──

    #[tokio::test]
    async fn test_free_plan_gate_blocks_without_lm_call() {
        let provider = Arc::new(MockProvider::simple("should not be called"));
        let settings = AgentSettings {
            plan: "free".into(),
            ..default_settings()
        };
        let (agent, _bus, _dir) = make_loop(provider.clone(), settings, vec![]);

        let msg = InboundMessage::new("telegram", "u1", "42", "hi");
        let response = agent.process_message(&msg).await.unwrap();

        assert!(response.content.starts_with("Free trial is currently paused"));
        assert_eq!(response.channel, "telegram");
        assert_eq!(response.chat_id, "42");
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_free_plan_internal_messages_pass() {
        let provider = Arc::new(MockProvider::simple("internal ok"));
        let settings = AgentSettings {
            plan: "free".into(),
            ..default_settings()
        };
        let (agent, _bus, _dir) = make_loop(provider.clone(), settings, vec![]);

        let mut msg = InboundMessage::new("telegram", "u1", "42", "tick");
        msg.metadata.insert("internal".into(), json!(true));
        let response = agent.process_message(&msg).await.unwrap();

        assert_eq!(response.content, "internal ok");
        assert_eq!(provider.call_count(), 1);
    }

    // ── Scenario: credit block ──

    #[tokio::test]
    async fn test_credit_block_exhausted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/internal/credit-check/u1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": false})))
            .mount(&server)
            .await;

        let provider = Arc::new(MockProvider::simple("should not be called"));
        let settings = AgentSettings {
            platform_url: Some(server.uri()),
            credit_user_id: Some("u1".into()),
            ..default_settings()
        };
        let (agent, _bus, _dir) = make_loop(provider.clone(), settings, vec![]);

        let msg = InboundMessage::new("telegram", "u1", "42", "hi");
        let response = agent.process_message(&msg).await.unwrap();

        assert!(response.content.contains("credits have been used up"));
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_credit_check_fail_closed() {
        let provider = Arc::new(MockProvider::simple("should not be called"));
        let settings = AgentSettings {
            // Nothing listens here — the check must fail closed.
            platform_url: Some("http://127.0.0.1:1".into()),
            credit_user_id: Some("u1".into()),
            ..default_settings()
        };
        let (agent, _bus, _dir) = make_loop(provider.clone(), settings, vec![]);

        let msg = InboundMessage::new("telegram", "u1", "42", "hi");
        let response = agent.process_message(&msg).await.unwrap();

        assert!(response.content.contains("Unable to verify"));
        assert_eq!(provider.call_count(), 0);
    }

    // ── Scenario: tool iteration ──

    #[tokio::test]
    async fn test_tool_iteration_echoes_result_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let test_file = dir.path().join("a.txt");
        std::fs::write(&test_file, "file content here").unwrap();

        let tool_call = ToolCall::new(
            "call_1",
            "read_file",
            json!({"path": test_file.to_str().unwrap()}).to_string(),
        );

        let provider = Arc::new(MockProvider::new(vec![
            LlmResponse {
                content: None,
                tool_calls: vec![tool_call],
                ..Default::default()
            },
            LlmResponse {
                content: Some("done".into()),
                ..Default::default()
            },
        ]));

        let bus = Arc::new(MessageBus::new(32));
        let agent = AgentLoop::new(
            bus,
            provider.clone(),
            dir.path().to_path_buf(),
            default_settings(),
            None,
            vec![],
        )
        .unwrap();

        let msg = InboundMessage::new("cli", "user", "direct", "Read a.txt");
        let response = agent.process_message(&msg).await.unwrap();

        assert_eq!(response.content, "done");
        assert_eq!(provider.call_count(), 2);

        // The second call's context must carry a tool result paired to the
        // call id.
        let seen = provider.seen_messages.lock().unwrap();
        let second = &seen[1];
        assert!(second.iter().any(|m| matches!(
            m,
            Message::Tool { tool_call_id, content } if tool_call_id == "call_1" && content == "file content here"
        )));

        // And the session history recorded the (user, assistant) pair.
        let history = agent.sessions.get_history("cli:direct");
        assert_eq!(history.len(), 2);
        assert!(matches!(&history[1], Message::Assistant { content: Some(c), .. } if c == "done"));
    }

    // ── Scenario: tool failure cap ──

    #[tokio::test]
    async fn test_tool_failure_cap_aborts_turn() {
        // The LM keeps requesting a failing tool; the loop must abort after
        // exactly max_tool_retries consecutive failures.
        let make_call = |i: usize| LlmResponse {
            content: None,
            tool_calls: vec![ToolCall::new(format!("call_{i}"), "always_fail", "{}")],
            ..Default::default()
        };
        let responses: Vec<LlmResponse> = (0..10).map(make_call).collect();

        let provider = Arc::new(MockProvider::new(responses));
        let settings = AgentSettings {
            max_tool_retries: 3,
            ..default_settings()
        };
        let (agent, _bus, _dir) = make_loop(provider.clone(), settings, vec![Arc::new(AlwaysFailTool)]);

        let msg = InboundMessage::new("cli", "user", "direct", "do the thing");
        let response = agent.process_message(&msg).await.unwrap();

        assert!(response.content.starts_with("I've encountered repeated errors"));
        assert!(response.content.contains("nope"));
        // One failing call per iteration → exactly 3 LM calls.
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn test_tool_failure_counter_resets_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let ok_file = dir.path().join("ok.txt");
        std::fs::write(&ok_file, "fine").unwrap();

        // fail, succeed, fail, fail, then terminal — never 3 in a row.
        let responses = vec![
            LlmResponse {
                content: None,
                tool_calls: vec![ToolCall::new("c1", "always_fail", "{}")],
                ..Default::default()
            },
            LlmResponse {
                content: None,
                tool_calls: vec![ToolCall::new(
                    "c2",
                    "read_file",
                    json!({"path": ok_file.to_str().unwrap()}).to_string(),
                )],
                ..Default::default()
            },
            LlmResponse {
                content: None,
                tool_calls: vec![ToolCall::new("c3", "always_fail", "{}")],
                ..Default::default()
            },
            LlmResponse {
                content: None,
                tool_calls: vec![ToolCall::new("c4", "always_fail", "{}")],
                ..Default::default()
            },
            LlmResponse {
                content: Some("made it".into()),
                ..Default::default()
            },
        ];

        let provider = Arc::new(MockProvider::new(responses));
        let settings = AgentSettings {
            max_tool_retries: 3,
            ..default_settings()
        };
        let bus = Arc::new(MessageBus::new(32));
        let agent = AgentLoop::new(
            bus,
            provider.clone(),
            dir.path().to_path_buf(),
            settings,
            None,
            vec![Arc::new(AlwaysFailTool)],
        )
        .unwrap();

        let msg = InboundMessage::new("cli", "user", "direct", "mixed luck");
        let response = agent.process_message(&msg).await.unwrap();

        assert_eq!(response.content, "made it");
        assert_eq!(provider.call_count(), 5);
    }

    // ── Scenario: system routing ──

    #[tokio::test]
    async fn test_system_message_routes_to_origin() {
        let provider = Arc::new(MockProvider::simple("Here's a summary of the result."));
        let (agent, _bus, _dir) = make_loop(provider, default_settings(), vec![]);

        let msg = InboundMessage::new("system", "subagent", "telegram:42", "done");
        let response = agent.process_message(&msg).await.unwrap();

        assert_eq!(response.channel, "telegram");
        assert_eq!(response.chat_id, "42");
        assert_eq!(response.content, "Here's a summary of the result.");

        // The origin session recorded the system-prefixed user turn.
        let history = agent.sessions.get_history("telegram:42");
        assert!(matches!(
            &history[0],
            Message::User { content: ferrobot_core::types::MessageContent::Text(t) }
                if t == "[System: subagent] done"
        ));
    }

    #[tokio::test]
    async fn test_system_message_skips_gating() {
        let provider = Arc::new(MockProvider::simple("summary"));
        let settings = AgentSettings {
            plan: "free".into(),
            ..default_settings()
        };
        let (agent, _bus, _dir) = make_loop(provider.clone(), settings, vec![]);

        let msg = InboundMessage::new("system", "cron", "slack:C1", "reminder fired");
        let response = agent.process_message(&msg).await.unwrap();

        assert_eq!(response.content, "summary");
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_system_message_fallback_content() {
        // All iterations burn on tool calls → fallback text.
        let responses: Vec<LlmResponse> = (0..3)
            .map(|i| LlmResponse {
                content: None,
                tool_calls: vec![ToolCall::new(
                    format!("c{i}"),
                    "list_dir",
                    json!({"path": std::env::temp_dir().to_str().unwrap()}).to_string(),
                )],
                ..Default::default()
            })
            .collect();

        let provider = Arc::new(MockProvider::new(responses));
        let settings = AgentSettings {
            max_iterations: 3,
            ..default_settings()
        };
        let (agent, _bus, _dir) = make_loop(provider, settings, vec![]);

        let msg = InboundMessage::new("system", "subagent", "whatsapp:555", "result");
        let response = agent.process_message(&msg).await.unwrap();
        assert_eq!(response.content, "Background task completed.");
    }

    // ── Scenario: cron re-entry ──

    #[tokio::test]
    async fn test_cron_reentry_round_trip() {
        use ferrobot_cron::CronSchedule;

        let bus = Arc::new(MessageBus::new(32));
        let dir = tempfile::tempdir().unwrap();
        let cron = Arc::new(CronService::new(
            bus.clone(),
            Some(dir.path().join("jobs.json")),
        ));

        let provider = Arc::new(MockProvider::simple("Reminder: water the plants"));
        let agent = AgentLoop::new(
            bus.clone(),
            provider,
            dir.path().to_path_buf(),
            default_settings(),
            Some(cron.clone()),
            vec![],
        )
        .unwrap();

        let job = cron
            .add_job(
                "plants",
                CronSchedule::every(60_000),
                "water the plants",
                true,
                Some("telegram".into()),
                Some("42".into()),
                false,
            )
            .await
            .unwrap();
        cron.fire_job(&job.id).await;

        // The firing lands on the bus as an internal system message...
        let inbound = bus.consume_inbound(Duration::from_millis(200)).await.unwrap();
        assert_eq!(inbound.channel, "system");
        assert_eq!(inbound.chat_id, "telegram:42");
        assert!(inbound.is_internal());

        // ...and the loop routes the reply back to telegram:42.
        let response = agent.process_message(&inbound).await.unwrap();
        assert_eq!(response.channel, "telegram");
        assert_eq!(response.chat_id, "42");
    }

    // ── Misc loop behavior ──

    #[tokio::test]
    async fn test_process_direct() {
        let provider = Arc::new(MockProvider::simple("Hello from Ferrobot!"));
        let (agent, _bus, _dir) = make_loop(provider, default_settings(), vec![]);

        let result = agent.process_direct("Hi").await.unwrap();
        assert_eq!(result, "Hello from Ferrobot!");
    }

    #[tokio::test]
    async fn test_max_iterations_fallback() {
        let tool_call = ToolCall::new(
            "call_loop",
            "list_dir",
            json!({"path": std::env::temp_dir().to_str().unwrap()}).to_string(),
        );
        let responses: Vec<LlmResponse> = (0..10)
            .map(|_| LlmResponse {
                content: None,
                tool_calls: vec![tool_call.clone()],
                ..Default::default()
            })
            .collect();

        let provider = Arc::new(MockProvider::new(responses));
        let settings = AgentSettings {
            max_iterations: 5,
            ..default_settings()
        };
        let (agent, _bus, _dir) = make_loop(provider.clone(), settings, vec![]);

        let result = agent.process_direct("loop forever").await.unwrap();
        assert!(result.contains("completed processing"));
        assert_eq!(provider.call_count(), 5);
    }

    #[tokio::test]
    async fn test_provider_error_bubbles() {
        struct ErrProvider;

        #[async_trait]
        impl LlmProvider for ErrProvider {
            async fn chat(
                &self,
                _messages: &[Message],
                _tools: Option<&[ToolDefinition]>,
                _model: &str,
                _config: &LlmRequestConfig,
            ) -> anyhow::Result<LlmResponse> {
                anyhow::bail!("provider down")
            }
            fn default_model(&self) -> &str {
                "err"
            }
            fn display_name(&self) -> &str {
                "Err"
            }
        }

        let bus = Arc::new(MessageBus::new(32));
        let dir = tempfile::tempdir().unwrap();
        let agent = AgentLoop::new(
            bus,
            Arc::new(ErrProvider),
            dir.path().to_path_buf(),
            default_settings(),
            None,
            vec![],
        )
        .unwrap();

        let msg = InboundMessage::new("telegram", "u", "1", "hi");
        let result = agent.process_message(&msg).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_run_replies_with_error_message() {
        struct ErrProvider;

        #[async_trait]
        impl LlmProvider for ErrProvider {
            async fn chat(
                &self,
                _messages: &[Message],
                _tools: Option<&[ToolDefinition]>,
                _model: &str,
                _config: &LlmRequestConfig,
            ) -> anyhow::Result<LlmResponse> {
                anyhow::bail!("provider down")
            }
            fn default_model(&self) -> &str {
                "err"
            }
            fn display_name(&self) -> &str {
                "Err"
            }
        }

        let bus = Arc::new(MessageBus::new(32));
        bus.register_channel("telegram").await;
        let dir = tempfile::tempdir().unwrap();
        let agent = Arc::new(
            AgentLoop::new(
                bus.clone(),
                Arc::new(ErrProvider),
                dir.path().to_path_buf(),
                default_settings(),
                None,
                vec![],
            )
            .unwrap(),
        );

        let runner = agent.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        bus.publish_inbound(InboundMessage::new("telegram", "u", "1", "hi"))
            .await
            .unwrap();

        let reply = bus
            .consume_outbound("telegram", Duration::from_secs(3))
            .await
            .unwrap();
        assert!(reply.content.starts_with("Sorry, I encountered an error:"));

        agent.stop();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_session_key_override_binds_session() {
        let provider = Arc::new(MockProvider::simple("ok"));
        let (agent, _bus, _dir) = make_loop(provider, default_settings(), vec![]);

        let mut msg = InboundMessage::new("cli", "user", "direct", "hello");
        msg.metadata
            .insert("session_key_override".into(), json!("custom:key"));
        agent.process_message(&msg).await.unwrap();

        assert_eq!(agent.sessions.get_history("custom:key").len(), 2);
        assert!(agent.sessions.get_history("cli:direct").is_empty());
    }

    #[tokio::test]
    async fn test_usage_accumulates_across_iterations() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("x.txt");
        std::fs::write(&f, "x").unwrap();

        let responses = vec![
            LlmResponse {
                content: None,
                tool_calls: vec![ToolCall::new(
                    "c1",
                    "read_file",
                    json!({"path": f.to_str().unwrap()}).to_string(),
                )],
                usage: Some(UsageInfo {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    total_tokens: 15,
                }),
                ..Default::default()
            },
            LlmResponse {
                content: Some("done".into()),
                usage: Some(UsageInfo {
                    prompt_tokens: 20,
                    completion_tokens: 7,
                    total_tokens: 27,
                }),
                ..Default::default()
            },
        ];

        let provider = Arc::new(MockProvider::new(responses));
        let bus = Arc::new(MessageBus::new(32));
        let agent = AgentLoop::new(
            bus,
            provider,
            dir.path().to_path_buf(),
            default_settings(),
            None,
            vec![],
        )
        .unwrap();

        let mut messages = vec![Message::user("go")];
        let (content, p, c) = agent.run_iterations(&mut messages).await.unwrap();
        assert_eq!(content.as_deref(), Some("done"));
        assert_eq!(p, 30);
        assert_eq!(c, 12);
    }

    #[test]
    fn test_usage_line_format() {
        assert_eq!(
            format_usage_line(120, 45, "mock-model"),
            "[USAGE] {\"prompt_tokens\":120,\"completion_tokens\":45,\"model\":\"mock-model\"}"
        );
    }

    #[test]
    fn test_default_tools_registered() {
        let provider = Arc::new(MockProvider::simple("ok"));
        let (agent, _bus, _dir) = make_loop(provider, default_settings(), vec![]);

        let names = agent.tools().tool_names();
        for expected in [
            "read_file",
            "write_file",
            "edit_file",
            "list_dir",
            "exec",
            "web_search",
            "web_fetch",
            "message",
            "spawn",
        ] {
            assert!(names.contains(&expected.to_string()), "missing {expected}");
        }
        // No cron service wired → no cron tool.
        assert!(!names.contains(&"cron".to_string()));
    }

    #[test]
    fn test_model_defaults_to_provider() {
        let provider = Arc::new(MockProvider::simple("ok"));
        let (agent, _bus, _dir) = make_loop(provider, default_settings(), vec![]);
        assert_eq!(agent.model(), "mock-model");
    }
}
