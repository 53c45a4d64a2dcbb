//! Generic HTTP-based LM provider for OpenAI-compatible APIs.
//!
//! One client covers every backend that speaks `/chat/completions`:
//! OpenRouter, OpenAI, Anthropic (via OpenRouter), DeepSeek, Groq, vLLM.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use ferrobot_core::config::schema::ProviderConfig;
use ferrobot_core::types::{
    ChatCompletionRequest, ChatCompletionResponse, LlmResponse, Message, ToolDefinition,
};

use crate::traits::{LlmProvider, LlmRequestConfig};

/// Known backends, matched against model prefixes and configured keys.
const PROVIDER_TABLE: &[(&str, &str)] = &[
    ("openrouter", "https://openrouter.ai/api/v1"),
    ("openai", "https://api.openai.com/v1"),
    ("anthropic", "https://openrouter.ai/api/v1"),
    ("deepseek", "https://api.deepseek.com/v1"),
    ("groq", "https://api.groq.com/openai/v1"),
];

/// An LM provider that talks to an OpenAI-compatible HTTP API.
pub struct HttpProvider {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    default_model: String,
    display_name: String,
}

impl std::fmt::Debug for HttpProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProvider")
            .field("api_base", &self.api_base)
            .field("default_model", &self.default_model)
            .field("provider", &self.display_name)
            .finish()
    }
}

impl HttpProvider {
    /// Create a provider pointing at `api_base` with the given key.
    pub fn new(name: &str, api_base: &str, api_key: &str, model: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_default();

        HttpProvider {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            default_model: model.to_string(),
            display_name: name.to_string(),
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.api_base)
    }
}

#[async_trait]
impl LlmProvider for HttpProvider {
    async fn chat(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
        model: &str,
        config: &LlmRequestConfig,
    ) -> anyhow::Result<LlmResponse> {
        debug!(
            provider = %self.display_name,
            model = %model,
            messages = messages.len(),
            tools = tools.map_or(0, |t| t.len()),
            "calling LM"
        );

        let request_body = ChatCompletionRequest {
            model: model.to_string(),
            messages: messages.to_vec(),
            tools: tools.map(|t| t.to_vec()),
            tool_choice: tools.map(|_| "auto".to_string()),
            max_tokens: Some(config.max_tokens),
            temperature: Some(config.temperature),
        };

        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("LM request failed: {e}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read error body".to_string());
            anyhow::bail!("LM returned {status}: {body}");
        }

        let chat_resp: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("failed to parse LM response: {e}"))?;

        let llm_resp: LlmResponse = chat_resp.into();
        debug!(
            provider = %self.display_name,
            has_content = llm_resp.content.is_some(),
            tool_calls = llm_resp.tool_calls.len(),
            "LM response received"
        );
        Ok(llm_resp)
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }
}

/// Pick a provider for `model` from the configured set.
///
/// A `provider/model` prefix selects that backend directly; otherwise the
/// first configured backend in table order wins.
pub fn create_provider(
    model: &str,
    providers: &HashMap<String, ProviderConfig>,
) -> anyhow::Result<HttpProvider> {
    // Explicit prefix, e.g. "deepseek/deepseek-chat".
    if let Some((prefix, _rest)) = model.split_once('/') {
        if let Some((name, default_base)) = PROVIDER_TABLE.iter().find(|(n, _)| *n == prefix) {
            if let Some(cfg) = providers.get(*name) {
                if cfg.is_configured() {
                    let base = cfg.api_base.as_deref().unwrap_or(default_base);
                    return Ok(HttpProvider::new(name, base, &cfg.api_key, model));
                }
            }
            // Anthropic models route through OpenRouter when only that is
            // configured.
            if let Some(or) = providers.get("openrouter") {
                if or.is_configured() {
                    let base = or.api_base.as_deref().unwrap_or("https://openrouter.ai/api/v1");
                    return Ok(HttpProvider::new("openrouter", base, &or.api_key, model));
                }
            }
        }
    }

    // No usable prefix: first configured backend wins.
    for (name, default_base) in PROVIDER_TABLE {
        if let Some(cfg) = providers.get(*name) {
            if cfg.is_configured() {
                let base = cfg.api_base.as_deref().unwrap_or(default_base);
                return Ok(HttpProvider::new(name, base, &cfg.api_key, model));
            }
        }
    }

    anyhow::bail!("no LM provider configured (set an API key in config.json)")
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn configured(key: &str) -> ProviderConfig {
        ProviderConfig {
            api_key: key.into(),
            api_base: None,
        }
    }

    #[tokio::test]
    async fn test_chat_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{
                    "message": { "content": "Hello there!", "tool_calls": null },
                    "finish_reason": "stop"
                }],
                "usage": { "prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15 }
            })))
            .mount(&server)
            .await;

        let provider = HttpProvider::new("test", &server.uri(), "key", "test-model");
        let resp = provider
            .chat(
                &[Message::user("hi")],
                None,
                "test-model",
                &LlmRequestConfig::default(),
            )
            .await
            .unwrap();

        assert_eq!(resp.content.as_deref(), Some("Hello there!"));
        assert_eq!(resp.usage.unwrap().prompt_tokens, 12);
    }

    #[tokio::test]
    async fn test_chat_http_error_propagates() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let provider = HttpProvider::new("test", &server.uri(), "key", "test-model");
        let result = provider
            .chat(
                &[Message::user("hi")],
                None,
                "test-model",
                &LlmRequestConfig::default(),
            )
            .await;

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("500"));
    }

    #[tokio::test]
    async fn test_chat_tool_calls_parsed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{
                    "message": {
                        "content": null,
                        "tool_calls": [{
                            "id": "call_1",
                            "type": "function",
                            "function": { "name": "read_file", "arguments": "{\"path\":\"a.txt\"}" }
                        }]
                    },
                    "finish_reason": "tool_calls"
                }],
                "usage": null
            })))
            .mount(&server)
            .await;

        let provider = HttpProvider::new("test", &server.uri(), "key", "test-model");
        let resp = provider
            .chat(
                &[Message::user("read a.txt")],
                None,
                "test-model",
                &LlmRequestConfig::default(),
            )
            .await
            .unwrap();

        assert!(resp.has_tool_calls());
        assert_eq!(resp.tool_calls[0].function.name, "read_file");
    }

    #[test]
    fn test_create_provider_by_prefix() {
        let mut providers = HashMap::new();
        providers.insert("deepseek".to_string(), configured("ds-key"));

        let p = create_provider("deepseek/deepseek-chat", &providers).unwrap();
        assert_eq!(p.display_name(), "deepseek");
        assert_eq!(p.default_model(), "deepseek/deepseek-chat");
    }

    #[test]
    fn test_create_provider_anthropic_via_openrouter() {
        let mut providers = HashMap::new();
        providers.insert("openrouter".to_string(), configured("or-key"));

        let p = create_provider("anthropic/claude-sonnet-4-20250514", &providers).unwrap();
        assert_eq!(p.display_name(), "openrouter");
    }

    #[test]
    fn test_create_provider_first_configured() {
        let mut providers = HashMap::new();
        providers.insert("groq".to_string(), configured("gq-key"));

        let p = create_provider("llama-3.3-70b", &providers).unwrap();
        assert_eq!(p.display_name(), "groq");
    }

    #[test]
    fn test_create_provider_none_configured() {
        let providers = HashMap::new();
        assert!(create_provider("gpt-4o", &providers).is_err());
    }
}
