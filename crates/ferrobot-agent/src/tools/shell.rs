//! Shell tool — execute commands in a subprocess.
//!
//! Includes a deny-pattern safety guard and optional workspace restriction.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::warn;

use ferrobot_core::tool::{optional_string, require_string, Tool};

/// Maximum output length before truncation (characters).
const MAX_OUTPUT_LEN: usize = 10_000;

/// Default command timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Dangerous command patterns that are always blocked.
const DENY_PATTERNS: &[&str] = &[
    r"\brm\s+-[rf]{1,2}\b",
    r"\bdel\s+/[fq]\b",
    r"\brmdir\s+/s\b",
    r"\b(format|mkfs|diskpart)\b",
    r"\bdd\s+if=",
    r">\s*/dev/sd",
    r"\b(shutdown|reboot|poweroff)\b",
    r":\(\)\s*\{.*\};\s*:", // fork bomb
];

/// Execute shell commands in a subprocess.
pub struct ExecTool {
    working_dir: PathBuf,
    timeout: Duration,
    restrict_to_workspace: bool,
    deny_regexes: Vec<Regex>,
}

impl ExecTool {
    pub fn new(working_dir: PathBuf, timeout_secs: Option<u64>, restrict_to_workspace: bool) -> Self {
        let deny_regexes: Vec<Regex> = DENY_PATTERNS
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect();

        Self {
            working_dir,
            timeout: Duration::from_secs(timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)),
            restrict_to_workspace,
            deny_regexes,
        }
    }

    /// Check if a command is safe to execute. Returns an error message if
    /// blocked.
    fn guard_command(&self, command: &str, cwd: &str) -> Option<String> {
        let lower = command.to_lowercase();

        for re in &self.deny_regexes {
            if re.is_match(&lower) {
                warn!(command = command, "command blocked by safety guard");
                return Some("Command blocked by safety guard (dangerous pattern detected)".into());
            }
        }

        if self.restrict_to_workspace {
            if command.contains("../") || command.contains("..\\") {
                return Some("Command blocked: path traversal (../) not allowed in restricted mode".into());
            }

            let cwd_path = PathBuf::from(cwd);
            if let Ok(re) = Regex::new(r#"(?:/[^\s"']+|[A-Za-z]:\\[^\s"']+)"#) {
                for cap in re.find_iter(command) {
                    let p = PathBuf::from(cap.as_str());
                    let resolved = if p.exists() {
                        p.canonicalize().unwrap_or(p)
                    } else {
                        p
                    };
                    if !resolved.starts_with(&cwd_path) {
                        return Some(format!(
                            "Command references path '{}' outside workspace",
                            cap.as_str()
                        ));
                    }
                }
            }
        }

        None
    }
}

#[async_trait]
impl Tool for ExecTool {
    fn name(&self) -> &str {
        "exec"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return its output. \
         Use this for running builds, tests, git, or any CLI tool."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "working_dir": {
                    "type": "string",
                    "description": "Working directory (optional, defaults to the workspace)"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, params: HashMap<String, Value>) -> anyhow::Result<String> {
        let command = require_string(&params, "command")?;
        let cwd = optional_string(&params, "working_dir")
            .map(PathBuf::from)
            .unwrap_or_else(|| self.working_dir.clone());
        let cwd_str = cwd.display().to_string();

        if let Some(reason) = self.guard_command(&command, &cwd_str) {
            anyhow::bail!("{reason}");
        }

        let output = tokio::time::timeout(
            self.timeout,
            Command::new("sh").arg("-c").arg(&command).current_dir(&cwd).output(),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Command timed out after {}s", self.timeout.as_secs()))?
        .map_err(|e| anyhow::anyhow!("Failed to run command: {e}"))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        let mut result = String::new();
        if !stdout.is_empty() {
            result.push_str(&stdout);
        }
        if !stderr.is_empty() {
            if !result.is_empty() {
                result.push('\n');
            }
            result.push_str("stderr: ");
            result.push_str(&stderr);
        }
        if !output.status.success() {
            if !result.is_empty() {
                result.push('\n');
            }
            result.push_str(&format!(
                "(exit code: {})",
                output.status.code().unwrap_or(-1)
            ));
        }
        if result.is_empty() {
            result = "(no output)".into();
        }

        if result.len() > MAX_OUTPUT_LEN {
            result.truncate(MAX_OUTPUT_LEN);
            result.push_str("\n... (output truncated)");
        }

        Ok(result)
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
