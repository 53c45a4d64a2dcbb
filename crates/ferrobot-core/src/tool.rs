//! The `Tool` trait — the interface every agent capability implements.
//!
//! Lives in the core crate so tool implementations (including the browser
//! crate) don't need to depend on the agent crate that dispatches them.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

use crate::types::ToolDefinition;

/// Every agent tool implements this trait.
///
/// The agent loop discovers tools via `name()`, sends their schemas to the
/// LM via `to_definition()`, and dispatches calls via `execute()`.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name used by the LM to call this tool (e.g. `"read_file"`).
    fn name(&self) -> &str;

    /// Human-readable description shown to the LM.
    fn description(&self) -> &str;

    /// JSON Schema describing the parameters.
    ///
    /// Must be `{"type": "object", "properties": {...}, "required": [...]}`.
    fn parameters(&self) -> Value;

    /// Execute the tool with the given arguments.
    ///
    /// Returns the tool output as a string (the LM reads this). On failure,
    /// return an `Err` — the registry catches it and rewrites it to an
    /// `"Error:"`-prefixed string for the LM.
    async fn execute(&self, params: HashMap<String, Value>) -> anyhow::Result<String>;

    /// Build the `ToolDefinition` sent to the LM. Rarely needs overriding.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), self.description(), self.parameters())
    }
}

// ─────────────────────────────────────────────
// Param helpers
// ─────────────────────────────────────────────

/// Extract a required `String` param, returning a user-friendly error.
pub fn require_string(params: &HashMap<String, Value>, key: &str) -> anyhow::Result<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("Missing required parameter: {key}"))
}

/// Extract an optional `String` param.
pub fn optional_string(params: &HashMap<String, Value>, key: &str) -> Option<String> {
    params.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

/// Extract an optional integer param.
pub fn optional_i64(params: &HashMap<String, Value>, key: &str) -> Option<i64> {
    params.get(key).and_then(|v| v.as_i64())
}

/// Extract an optional boolean param (defaults to `false` if absent).
pub fn optional_bool(params: &HashMap<String, Value>, key: &str) -> bool {
    params.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}
