//! Configuration schema.
//!
//! Hierarchy: `Config` → `AgentsConfig`, `ProvidersConfig`, `ChannelsConfig`,
//! `ToolsConfig`, `TranscriptionConfig`.
//!
//! JSON on disk uses **camelCase** keys; Rust uses snake_case.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ─────────────────────────────────────────────
// Root config
// ─────────────────────────────────────────────

/// Root configuration — loaded from `~/.ferrobot/config.json` + env vars.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub agents: AgentsConfig,
    pub providers: ProvidersConfig,
    pub channels: ChannelsConfig,
    pub tools: ToolsConfig,
    #[serde(default)]
    pub transcription: TranscriptionConfig,
}

// ─────────────────────────────────────────────
// Agents
// ─────────────────────────────────────────────

/// Agent configuration container.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentsConfig {
    pub defaults: AgentDefaults,
}

/// Default agent settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentDefaults {
    /// Default workspace directory.
    pub workspace: String,
    /// Default LM model identifier.
    pub model: String,
    /// Maximum tokens to generate per response.
    pub max_tokens: u32,
    /// Sampling temperature (0.0 – 2.0).
    pub temperature: f64,
    /// Maximum LM ↔ tool loop iterations per message.
    pub max_tool_iterations: u32,
    /// Consecutive tool failures within one turn before the turn aborts.
    pub max_tool_retries: u32,
    /// Billing plan ("free" replies with the upgrade teaser, no LM call).
    pub plan: String,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            workspace: "~/.ferrobot/workspace".to_string(),
            model: "anthropic/claude-sonnet-4-20250514".to_string(),
            max_tokens: 8192,
            temperature: 0.7,
            max_tool_iterations: 20,
            max_tool_retries: 3,
            plan: "pro".to_string(),
        }
    }
}

// ─────────────────────────────────────────────
// Providers
// ─────────────────────────────────────────────

/// Configuration for a single LM provider (API key, base URL).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: String,
    /// Custom API base URL (overrides the provider default).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
}

impl ProviderConfig {
    /// Whether this provider has a configured API key.
    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }
}

/// All provider configurations.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub anthropic: ProviderConfig,
    #[serde(default)]
    pub openai: ProviderConfig,
    #[serde(default)]
    pub openrouter: ProviderConfig,
    #[serde(default)]
    pub deepseek: ProviderConfig,
    #[serde(default)]
    pub groq: ProviderConfig,
}

impl ProvidersConfig {
    /// Get a provider config by name (e.g. `"anthropic"`).
    pub fn get_by_name(&self, name: &str) -> Option<&ProviderConfig> {
        match name {
            "anthropic" => Some(&self.anthropic),
            "openai" => Some(&self.openai),
            "openrouter" => Some(&self.openrouter),
            "deepseek" => Some(&self.deepseek),
            "groq" => Some(&self.groq),
            _ => None,
        }
    }

    /// Convert to a name-keyed map for the provider factory.
    pub fn to_map(&self) -> HashMap<String, ProviderConfig> {
        let entries: &[(&str, &ProviderConfig)] = &[
            ("anthropic", &self.anthropic),
            ("openai", &self.openai),
            ("openrouter", &self.openrouter),
            ("deepseek", &self.deepseek),
            ("groq", &self.groq),
        ];
        entries
            .iter()
            .map(|(name, cfg)| (name.to_string(), (*cfg).clone()))
            .collect()
    }
}

// ─────────────────────────────────────────────
// Channels
// ─────────────────────────────────────────────

/// All channel configurations.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub slack: SlackConfig,
    #[serde(default)]
    pub teams: TeamsConfig,
    #[serde(default)]
    pub whatsapp: WhatsAppConfig,
}

/// Telegram channel config.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelegramConfig {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub allowed_users: Vec<String>,
}

/// Slack channel config.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SlackConfig {
    /// Bot token (`xoxb-...`) — required.
    #[serde(default)]
    pub bot_token: String,
    /// App-level token (`xapp-...`) — required for Socket Mode.
    #[serde(default)]
    pub app_token: String,
    /// Allowed user IDs. Empty = allow everyone.
    #[serde(default)]
    pub allowed_users: Vec<String>,
    /// Channel/group response policy: `"mention"` (default) or `"open"`.
    #[serde(default = "default_group_policy")]
    pub group_policy: String,
}

fn default_group_policy() -> String {
    "mention".to_string()
}

/// Microsoft Teams channel config (Bot Framework).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TeamsConfig {
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub app_password: String,
    #[serde(default)]
    pub allowed_users: Vec<String>,
}

/// WhatsApp bridge config.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WhatsAppConfig {
    /// Bridge websocket URL (e.g. `ws://localhost:3001`).
    #[serde(default)]
    pub bridge_url: String,
    #[serde(default)]
    pub allowed_users: Vec<String>,
}

// ─────────────────────────────────────────────
// Tools
// ─────────────────────────────────────────────

/// Tool configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolsConfig {
    #[serde(default)]
    pub web: WebToolsConfig,
    #[serde(default)]
    pub exec: ExecToolConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    /// Restrict file/exec operations to the workspace directory.
    #[serde(default)]
    pub restrict_to_workspace: bool,
}

/// Web tools configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebToolsConfig {
    #[serde(default)]
    pub search: WebSearchConfig,
}

/// Web search configuration (Brave API).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebSearchConfig {
    #[serde(default)]
    pub api_key: String,
    pub max_results: u32,
}

impl Default for WebSearchConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            max_results: 5,
        }
    }
}

/// Shell exec tool configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecToolConfig {
    /// Timeout in seconds for shell commands.
    pub timeout: u64,
}

impl Default for ExecToolConfig {
    fn default() -> Self {
        Self { timeout: 60 }
    }
}

/// Browser tool configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrowserConfig {
    /// Whether the browser tool is registered at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// CAPTCHA solver provider: "capsolver", "2captcha", or "anticaptcha".
    /// Empty = no solving, detection only.
    #[serde(default)]
    pub captcha_provider: String,
    /// API key for the solver. Falls back to the provider's env var.
    #[serde(default)]
    pub captcha_api_key: String,
    /// Optional proxy URL for the browser.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            captcha_provider: String::new(),
            captcha_api_key: String::new(),
            proxy_url: None,
        }
    }
}

fn default_true() -> bool {
    true
}

// ─────────────────────────────────────────────
// Transcription
// ─────────────────────────────────────────────

/// Voice transcription configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TranscriptionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// API key for the transcription provider.
    /// Falls back to the groq provider key if empty.
    #[serde(default)]
    pub api_key: String,
    /// Whisper model name.
    #[serde(default = "default_whisper_model")]
    pub model: String,
}

fn default_whisper_model() -> String {
    "whisper-large-v3".into()
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: String::new(),
            model: "whisper-large-v3".into(),
        }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.agents.defaults.max_tokens, 8192);
        assert_eq!(config.agents.defaults.max_tool_iterations, 20);
        assert_eq!(config.agents.defaults.max_tool_retries, 3);
        assert_eq!(config.agents.defaults.plan, "pro");
        assert!(!config.tools.restrict_to_workspace);
        assert!(config.tools.browser.enabled);
    }

    #[test]
    fn test_config_from_json_camel_case() {
        let json = serde_json::json!({
            "agents": {
                "defaults": {
                    "model": "gpt-4o",
                    "maxTokens": 4096,
                    "maxToolRetries": 5,
                    "plan": "free"
                }
            }
        });

        let config: Config = serde_json::from_value(json).unwrap();
        assert_eq!(config.agents.defaults.model, "gpt-4o");
        assert_eq!(config.agents.defaults.max_tokens, 4096);
        assert_eq!(config.agents.defaults.max_tool_retries, 5);
        assert_eq!(config.agents.defaults.plan, "free");
        // Defaults preserved for missing fields
        assert_eq!(config.agents.defaults.temperature, 0.7);
    }

    #[test]
    fn test_config_json_uses_camel_case() {
        let config = Config::default();
        let json = serde_json::to_value(&config).unwrap();
        assert!(json["agents"]["defaults"].get("maxTokens").is_some());
        assert!(json["agents"]["defaults"].get("max_tokens").is_none());
        assert!(json["tools"].get("restrictToWorkspace").is_some());
    }

    #[test]
    fn test_provider_config_is_configured() {
        let empty = ProviderConfig::default();
        assert!(!empty.is_configured());

        let with_key = ProviderConfig {
            api_key: "sk-123".to_string(),
            ..Default::default()
        };
        assert!(with_key.is_configured());
    }

    #[test]
    fn test_providers_get_by_name() {
        let mut providers = ProvidersConfig::default();
        providers.openrouter.api_key = "sk-or-123".to_string();

        assert!(providers.get_by_name("openrouter").unwrap().is_configured());
        assert!(!providers.get_by_name("openai").unwrap().is_configured());
        assert!(providers.get_by_name("nonexistent").is_none());
    }

    #[test]
    fn test_channel_config_from_json() {
        let json = serde_json::json!({
            "channels": {
                "telegram": {
                    "token": "bot123:ABC",
                    "allowedUsers": ["user1", "user2"]
                },
                "teams": {
                    "appId": "app-guid",
                    "appPassword": "secret"
                },
                "whatsapp": {
                    "bridgeUrl": "ws://localhost:3001"
                }
            }
        });

        let config: Config = serde_json::from_value(json).unwrap();
        assert_eq!(config.channels.telegram.token, "bot123:ABC");
        assert_eq!(config.channels.telegram.allowed_users, vec!["user1", "user2"]);
        assert_eq!(config.channels.teams.app_id, "app-guid");
        assert_eq!(config.channels.whatsapp.bridge_url, "ws://localhost:3001");
        assert_eq!(config.channels.slack.group_policy, "mention");
    }

    #[test]
    fn test_browser_config_from_json() {
        let json = serde_json::json!({
            "tools": {
                "browser": {
                    "captchaProvider": "capsolver",
                    "captchaApiKey": "cap-123"
                }
            }
        });

        let config: Config = serde_json::from_value(json).unwrap();
        assert_eq!(config.tools.browser.captcha_provider, "capsolver");
        assert_eq!(config.tools.browser.captcha_api_key, "cap-123");
        assert!(config.tools.browser.enabled);
    }

    #[test]
    fn test_empty_json_gives_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.agents.defaults.max_tokens, 8192);
        assert_eq!(config.tools.exec.timeout, 60);
    }
}
