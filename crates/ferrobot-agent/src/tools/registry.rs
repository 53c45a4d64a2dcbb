//! Tool registry — name-keyed catalog of tools, dispatching LM tool calls.
//!
//! The catalog is immutable after startup. The LM always gets a `String`
//! result back; any failure shape begins with the literal `"Error:"`, which
//! is the prefix the agent loop uses to classify tool failures.

use std::collections::HashMap;
use std::sync::Arc;

use ferrobot_core::tool::Tool;
use ferrobot_core::types::ToolDefinition;
use tracing::{info, warn};

/// Stores tools keyed by name and dispatches calls.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Overwrites any previous tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        info!(tool = tool.name(), "registered tool");
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    /// Check if a tool is registered.
    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Names of all registered tools, sorted for determinism.
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// LM-facing definitions for all registered tools, sorted by name.
    pub fn get_definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        defs
    }

    /// Execute a tool by name with the given parameters.
    pub async fn execute(&self, name: &str, params: HashMap<String, serde_json::Value>) -> String {
        let tool = match self.tools.get(name) {
            Some(t) => t,
            None => {
                warn!(tool = name, "tool not found");
                return format!("Error: Tool '{name}' not found");
            }
        };

        match tool.execute(params).await {
            Ok(result) => result,
            Err(e) => {
                warn!(tool = name, error = %e, "tool execution failed");
                format!("Error: {e}")
            }
        }
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
