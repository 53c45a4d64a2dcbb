//! Spawn tool — delegate tasks to background sub-agents.
//!
//! Returns an immediate confirmation to the LM; when the sub-agent
//! finishes, it announces its result back through the message bus.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use ferrobot_core::tool::{optional_string, require_string, Tool};

use crate::subagent::{Origin, SubagentManager};

/// Tool that allows the agent to spawn background sub-agent tasks.
///
/// The agent loop calls `set_context` before each turn so sub-agent
/// results route back to the conversation that spawned them.
pub struct SpawnTool {
    manager: Arc<SubagentManager>,
    /// Current origin (channel, chat_id) — written by the loop per turn.
    context: Mutex<(String, String)>,
}

impl SpawnTool {
    pub fn new(manager: Arc<SubagentManager>) -> Self {
        Self {
            manager,
            context: Mutex::new(("cli".into(), "direct".into())),
        }
    }

    /// Set the current context (called by the agent loop per-message).
    pub async fn set_context(&self, channel: &str, chat_id: &str) {
        let mut ctx = self.context.lock().await;
        *ctx = (channel.to_string(), chat_id.to_string());
    }

    #[cfg(test)]
    pub async fn context(&self) -> (String, String) {
        self.context.lock().await.clone()
    }
}

#[async_trait]
impl Tool for SpawnTool {
    fn name(&self) -> &str {
        "spawn"
    }

    fn description(&self) -> &str {
        "Spawn a sub-agent to handle a task in the background. Use this for complex \
         or time-consuming tasks that can run independently. The sub-agent will \
         complete the task and report back when done."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "The task for the sub-agent to complete"
                },
                "label": {
                    "type": "string",
                    "description": "Optional short label for the task (for display)"
                }
            },
            "required": ["task"]
        })
    }

    async fn execute(&self, params: HashMap<String, Value>) -> anyhow::Result<String> {
        let task = require_string(&params, "task")?;
        let label = optional_string(&params, "label");

        let origin = {
            let ctx = self.context.lock().await;
            Origin::new(ctx.0.clone(), ctx.1.clone())
        };

        let confirmation = self.manager.spawn(task, label, origin).await;
        Ok(confirmation)
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ferrobot_core::bus::queue::MessageBus;
    use ferrobot_core::config::schema::ExecToolConfig;
    use ferrobot_core::types::{LlmResponse, Message, ToolDefinition};
    use ferrobot_providers::traits::{LlmProvider, LlmRequestConfig};

    struct MockProvider;

    #[async_trait]
    impl LlmProvider for MockProvider {
        async fn chat(
            &self,
            _messages: &[Message],
            _tools: Option<&[ToolDefinition]>,
            _model: &str,
            _config: &LlmRequestConfig,
        ) -> anyhow::Result<LlmResponse> {
            Ok(LlmResponse {
                content: Some("Sub-agent done.".into()),
                ..Default::default()
            })
        }

        fn default_model(&self) -> &str {
            "mock"
        }

        fn display_name(&self) -> &str {
            "Mock"
        }
    }

    fn create_test_spawn_tool() -> SpawnTool {
        let bus = Arc::new(MessageBus::new(32));
        let workspace = std::env::temp_dir().join("ferrobot_test_spawn_tool");
        let _ = std::fs::create_dir_all(&workspace);

        let mgr = Arc::new(SubagentManager::new(
            Arc::new(MockProvider),
            workspace,
            bus,
            "mock".into(),
            None,
            ExecToolConfig::default(),
            false,
            LlmRequestConfig::default(),
        ));

        SpawnTool::new(mgr)
    }

    #[test]
    fn test_spawn_tool_parameters_schema() {
        let tool = create_test_spawn_tool();
        let params = tool.parameters();

        assert_eq!(params["type"], "object");
        assert!(params["properties"]["task"].is_object());

        let required = params["required"].as_array().unwrap();
        assert!(required.contains(&json!("task")));
        assert!(!required.contains(&json!("label")));
    }

    #[tokio::test]
    async fn test_spawn_tool_set_context() {
        let tool = create_test_spawn_tool();
        tool.set_context("telegram", "chat_42").await;
        assert_eq!(tool.context().await, ("telegram".into(), "chat_42".into()));
    }

    #[tokio::test]
    async fn test_spawn_tool_execute() {
        let tool = create_test_spawn_tool();
        tool.set_context("slack", "C1").await;

        let mut params = HashMap::new();
        params.insert("task".into(), json!("Find all TODO items in the codebase"));
        params.insert("label".into(), json!("todos"));

        let result = tool.execute(params).await.unwrap();
        assert!(result.contains("Started background task"));
        assert!(result.contains("\"todos\""));
    }

    #[tokio::test]
    async fn test_spawn_tool_execute_missing_task() {
        let tool = create_test_spawn_tool();
        assert!(tool.execute(HashMap::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_spawn_tool_default_context() {
        let tool = create_test_spawn_tool();
        assert_eq!(tool.context().await, ("cli".into(), "direct".into()));
    }
}
