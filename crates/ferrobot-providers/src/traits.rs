//! The LM provider abstraction used by the agent loop.

use async_trait::async_trait;
use ferrobot_core::types::{LlmResponse, Message, ToolDefinition};

/// Per-call request configuration.
#[derive(Clone, Debug)]
pub struct LlmRequestConfig {
    /// Maximum tokens to generate.
    pub max_tokens: u32,
    /// Sampling temperature (0.0 – 2.0).
    pub temperature: f64,
}

impl Default for LlmRequestConfig {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            temperature: 0.7,
        }
    }
}

/// Trait that all LM providers implement.
///
/// Errors propagate to the caller: the agent loop's outer handler converts
/// a failed call into the single error reply for that message.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a chat completion request.
    ///
    /// `tools` is forwarded to the provider verbatim so the model can
    /// request tool calls.
    async fn chat(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
        model: &str,
        config: &LlmRequestConfig,
    ) -> anyhow::Result<LlmResponse>;

    /// The default model for this provider instance.
    fn default_model(&self) -> &str;

    /// Display name for logging.
    fn display_name(&self) -> &str;
}
