//! Config loader — reads `~/.ferrobot/config.json` and applies env
//! overrides, plus the workspace `.env` merge.
//!
//! # Loading precedence
//! 1. Defaults (from `Config::default()`)
//! 2. JSON file at `~/.ferrobot/config.json`
//! 3. Environment variables `FERROBOT_<SECTION>__<FIELD>` (override JSON)
//!
//! The workspace `.env` is merged separately at startup with existing
//! process env values taking precedence.

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::schema::Config;

/// Default config file path.
pub fn get_config_path() -> PathBuf {
    crate::utils::get_data_path().join("config.json")
}

/// Load configuration from the default path + env vars.
///
/// Falls back to `Config::default()` if the file doesn't exist or can't be
/// parsed.
pub fn load_config(path: Option<&Path>) -> Config {
    let config_path = path.map(PathBuf::from).unwrap_or_else(get_config_path);
    load_config_from_path(&config_path)
}

fn load_config_from_path(path: &Path) -> Config {
    if !path.exists() {
        info!("No config file found at {}, using defaults", path.display());
        return apply_env_overrides(Config::default());
    }

    debug!("Loading config from {}", path.display());

    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            warn!("Failed to read config file {}: {}", path.display(), e);
            return apply_env_overrides(Config::default());
        }
    };

    let config: Config = match serde_json::from_str(&content) {
        Ok(c) => c,
        Err(e) => {
            warn!("Failed to parse config JSON: {}", e);
            return apply_env_overrides(Config::default());
        }
    };

    apply_env_overrides(config)
}

/// Save configuration to disk (pretty-printed JSON with camelCase keys).
pub fn save_config(config: &Config, path: Option<&Path>) -> std::io::Result<()> {
    let config_path = path.map(PathBuf::from).unwrap_or_else(get_config_path);

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(config)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

    std::fs::write(&config_path, json)?;
    debug!("Config saved to {}", config_path.display());
    Ok(())
}

/// Merge `{workspace}/.env` into the process environment.
///
/// Existing process values take precedence, so platform-injected variables
/// always win over user-placed ones.
pub fn load_workspace_env(workspace: &Path) {
    let env_path = workspace.join(".env");
    if !env_path.is_file() {
        return;
    }

    match dotenvy::from_path_iter(&env_path) {
        Ok(iter) => {
            let mut loaded = 0usize;
            for item in iter.flatten() {
                let (key, value) = item;
                if std::env::var_os(&key).is_none() {
                    std::env::set_var(&key, &value);
                    loaded += 1;
                }
            }
            info!(path = %env_path.display(), loaded, "merged workspace .env");
        }
        Err(e) => {
            warn!(error = %e, "failed to parse workspace .env");
        }
    }
}

/// Apply environment variable overrides on top of a loaded config.
///
/// Env var format: `FERROBOT_<SECTION>__<FIELD>` (double underscore).
fn apply_env_overrides(mut config: Config) -> Config {
    if let Ok(val) = std::env::var("FERROBOT_AGENTS__DEFAULTS__MODEL") {
        config.agents.defaults.model = val;
    }
    if let Ok(val) = std::env::var("FERROBOT_AGENTS__DEFAULTS__MAX_TOKENS") {
        if let Ok(n) = val.parse::<u32>() {
            config.agents.defaults.max_tokens = n;
        }
    }
    if let Ok(val) = std::env::var("FERROBOT_AGENTS__DEFAULTS__WORKSPACE") {
        config.agents.defaults.workspace = val;
    }
    if let Ok(val) = std::env::var("FERROBOT_AGENTS__DEFAULTS__PLAN") {
        config.agents.defaults.plan = val;
    }

    apply_provider_env(&mut config.providers.anthropic, "ANTHROPIC");
    apply_provider_env(&mut config.providers.openai, "OPENAI");
    apply_provider_env(&mut config.providers.openrouter, "OPENROUTER");
    apply_provider_env(&mut config.providers.deepseek, "DEEPSEEK");
    apply_provider_env(&mut config.providers.groq, "GROQ");

    if let Ok(val) = std::env::var("FERROBOT_TOOLS__RESTRICT_TO_WORKSPACE") {
        config.tools.restrict_to_workspace = val == "true" || val == "1";
    }

    // Solver keys may also arrive via their conventional env vars.
    if config.tools.browser.captcha_api_key.is_empty() {
        for (provider, var) in [
            ("capsolver", "CAPSOLVER_API_KEY"),
            ("2captcha", "TWOCAPTCHA_API_KEY"),
            ("anticaptcha", "ANTICAPTCHA_API_KEY"),
        ] {
            if let Ok(val) = std::env::var(var) {
                if !val.is_empty() {
                    if config.tools.browser.captcha_provider.is_empty() {
                        config.tools.browser.captcha_provider = provider.to_string();
                    }
                    if config.tools.browser.captcha_provider == provider {
                        config.tools.browser.captcha_api_key = val;
                        break;
                    }
                }
            }
        }
    }

    config
}

fn apply_provider_env(provider: &mut super::schema::ProviderConfig, name: &str) {
    if let Ok(val) = std::env::var(format!("FERROBOT_PROVIDERS__{name}__API_KEY")) {
        provider.api_key = val;
    }
    if let Ok(val) = std::env::var(format!("FERROBOT_PROVIDERS__{name}__API_BASE")) {
        provider.api_base = Some(val);
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_temp_json(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_load_missing_file() {
        let config = load_config_from_path(Path::new("/nonexistent/path/config.json"));
        assert_eq!(config.agents.defaults.max_tokens, 8192);
    }

    #[test]
    fn test_load_valid_json() {
        let file = write_temp_json(
            r#"{
            "agents": {
                "defaults": {
                    "model": "gpt-4o",
                    "maxTokens": 2048
                }
            }
        }"#,
        );

        let config = load_config_from_path(file.path());
        assert_eq!(config.agents.defaults.model, "gpt-4o");
        assert_eq!(config.agents.defaults.max_tokens, 2048);
        assert_eq!(config.agents.defaults.temperature, 0.7);
    }

    #[test]
    fn test_load_invalid_json_returns_defaults() {
        let file = write_temp_json("not valid json {{{");
        let config = load_config_from_path(file.path());
        assert_eq!(config.agents.defaults.max_tokens, 8192);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::default();
        config.agents.defaults.model = "deepseek-chat".to_string();
        config.providers.deepseek.api_key = "ds-test".to_string();

        save_config(&config, Some(&path)).unwrap();

        let reloaded = load_config_from_path(&path);
        assert_eq!(reloaded.agents.defaults.model, "deepseek-chat");
        assert_eq!(reloaded.providers.deepseek.api_key, "ds-test");
    }

    #[test]
    fn test_env_override_model() {
        std::env::set_var("FERROBOT_AGENTS__DEFAULTS__MODEL", "test-model");
        let config = apply_env_overrides(Config::default());
        assert_eq!(config.agents.defaults.model, "test-model");
        std::env::remove_var("FERROBOT_AGENTS__DEFAULTS__MODEL");
    }

    #[test]
    fn test_env_override_provider_key() {
        std::env::set_var("FERROBOT_PROVIDERS__ANTHROPIC__API_KEY", "sk-env-key");
        let config = apply_env_overrides(Config::default());
        assert_eq!(config.providers.anthropic.api_key, "sk-env-key");
        std::env::remove_var("FERROBOT_PROVIDERS__ANTHROPIC__API_KEY");
    }

    #[test]
    fn test_workspace_env_does_not_override_existing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(".env"),
            "FERRO_TEST_EXISTING=from_file\nFERRO_TEST_NEW=fresh\n",
        )
        .unwrap();

        std::env::set_var("FERRO_TEST_EXISTING", "from_process");
        load_workspace_env(dir.path());

        assert_eq!(std::env::var("FERRO_TEST_EXISTING").unwrap(), "from_process");
        assert_eq!(std::env::var("FERRO_TEST_NEW").unwrap(), "fresh");

        std::env::remove_var("FERRO_TEST_EXISTING");
        std::env::remove_var("FERRO_TEST_NEW");
    }

    #[test]
    fn test_workspace_env_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        // No .env file — must be a no-op.
        load_workspace_env(dir.path());
    }

    #[test]
    fn test_saved_json_uses_camel_case() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        save_config(&Config::default(), Some(&path)).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let raw: serde_json::Value = serde_json::from_str(&content).unwrap();

        assert!(raw["agents"]["defaults"].get("maxTokens").is_some());
        assert!(raw["agents"]["defaults"].get("max_tokens").is_none());
    }
}
