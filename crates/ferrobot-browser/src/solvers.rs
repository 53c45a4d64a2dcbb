//! Third-party CAPTCHA solver adapters behind a common strategy trait.
//!
//! Protocol shape per provider:
//! - CapSolver / Anti-Captcha: JSON `createTask` + `getTaskResult` polling
//!   (2 s cadence, 60 and 40 iterations respectively).
//! - 2Captcha: form-style `in.php` + `res.php` polling (3 s cadence, 40
//!   iterations).
//!
//! Every HTTP call carries a 15 s timeout; the poll budgets bound a solve
//! at roughly two minutes.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::captcha::{CaptchaInfo, CaptchaKind};

/// Per-request HTTP timeout.
const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Minimum score requested for reCAPTCHA v3 tasks.
const V3_MIN_SCORE: f64 = 0.7;

/// Common interface over solving providers.
#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    /// Solve a detected challenge. `Ok(None)` means the provider gave up.
    async fn solve(&self, info: &CaptchaInfo) -> anyhow::Result<Option<String>>;

    /// Provider name for logging.
    fn name(&self) -> &str;
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_default()
}

/// Build a solver from config values; `None` when no provider configured.
pub fn solver_from_config(provider: &str, api_key: &str) -> Option<Box<dyn CaptchaSolver>> {
    if api_key.is_empty() {
        return None;
    }
    match provider {
        "capsolver" => Some(Box::new(CapSolver::new(api_key))),
        "2captcha" => Some(Box::new(TwoCaptcha::new(api_key))),
        "anticaptcha" => Some(Box::new(AntiCaptcha::new(api_key))),
        _ => None,
    }
}

// ─────────────────────────────────────────────
// CapSolver
// ─────────────────────────────────────────────

pub struct CapSolver {
    api_key: String,
    api_base: String,
    client: reqwest::Client,
}

impl CapSolver {
    pub fn new(api_key: &str) -> Self {
        Self {
            api_key: api_key.into(),
            api_base: "https://api.capsolver.com".into(),
            client: client(),
        }
    }

    #[cfg(test)]
    fn with_base(api_key: &str, base: &str) -> Self {
        let mut s = Self::new(api_key);
        s.api_base = base.into();
        s
    }

    fn task_payload(&self, info: &CaptchaInfo) -> Value {
        let mut task = json!({
            "websiteURL": info.page_url,
            "websiteKey": info.sitekey,
        });
        match info.kind {
            CaptchaKind::RecaptchaV2 => task["type"] = json!("ReCaptchaV2TaskProxyLess"),
            CaptchaKind::RecaptchaV3 => {
                task["type"] = json!("ReCaptchaV3TaskProxyLess");
                task["pageAction"] = json!(info.action.clone().unwrap_or_else(|| "verify".into()));
                task["minScore"] = json!(V3_MIN_SCORE);
            }
            CaptchaKind::Hcaptcha => task["type"] = json!("HCaptchaTaskProxyLess"),
            CaptchaKind::Turnstile => task["type"] = json!("AntiTurnstileTaskProxyLess"),
        }
        task
    }
}

#[async_trait]
impl CaptchaSolver for CapSolver {
    async fn solve(&self, info: &CaptchaInfo) -> anyhow::Result<Option<String>> {
        let create: Value = self
            .client
            .post(format!("{}/createTask", self.api_base))
            .json(&json!({
                "clientKey": self.api_key,
                "task": self.task_payload(info),
            }))
            .send()
            .await?
            .json()
            .await?;

        if create["errorId"].as_i64().unwrap_or(0) != 0 {
            anyhow::bail!(
                "CapSolver createTask failed: {}",
                create["errorDescription"].as_str().unwrap_or("unknown")
            );
        }
        let task_id = create["taskId"]
            .as_str()
            .map(String::from)
            .or_else(|| create["taskId"].as_i64().map(|n| n.to_string()))
            .ok_or_else(|| anyhow::anyhow!("CapSolver: no taskId in response"))?;

        debug!(task_id = %task_id, kind = info.kind.as_str(), "capsolver task created");

        for _ in 0..60 {
            tokio::time::sleep(Duration::from_secs(2)).await;

            let result: Value = self
                .client
                .post(format!("{}/getTaskResult", self.api_base))
                .json(&json!({ "clientKey": self.api_key, "taskId": task_id }))
                .send()
                .await?
                .json()
                .await?;

            match result["status"].as_str() {
                Some("ready") => {
                    let token = result["solution"]["gRecaptchaResponse"]
                        .as_str()
                        .or_else(|| result["solution"]["token"].as_str())
                        .map(String::from);
                    return Ok(token);
                }
                Some("processing") | None => continue,
                Some(other) => {
                    warn!(status = other, "capsolver unexpected status");
                    return Ok(None);
                }
            }
        }

        Ok(None)
    }

    fn name(&self) -> &str {
        "capsolver"
    }
}

// ─────────────────────────────────────────────
// 2Captcha
// ─────────────────────────────────────────────

pub struct TwoCaptcha {
    api_key: String,
    api_base: String,
    client: reqwest::Client,
}

impl TwoCaptcha {
    pub fn new(api_key: &str) -> Self {
        Self {
            api_key: api_key.into(),
            api_base: "https://2captcha.com".into(),
            client: client(),
        }
    }

    #[cfg(test)]
    fn with_base(api_key: &str, base: &str) -> Self {
        let mut s = Self::new(api_key);
        s.api_base = base.into();
        s
    }

    fn submit_params(&self, info: &CaptchaInfo) -> Vec<(String, String)> {
        let mut params = vec![
            ("key".to_string(), self.api_key.clone()),
            ("pageurl".to_string(), info.page_url.clone()),
            ("json".to_string(), "1".to_string()),
        ];
        match info.kind {
            CaptchaKind::RecaptchaV2 => {
                params.push(("method".into(), "userrecaptcha".into()));
                params.push(("googlekey".into(), info.sitekey.clone()));
            }
            CaptchaKind::RecaptchaV3 => {
                params.push(("method".into(), "userrecaptcha".into()));
                params.push(("googlekey".into(), info.sitekey.clone()));
                params.push(("version".into(), "v3".into()));
                params.push((
                    "action".into(),
                    info.action.clone().unwrap_or_else(|| "verify".into()),
                ));
                params.push(("min_score".into(), V3_MIN_SCORE.to_string()));
            }
            CaptchaKind::Hcaptcha => {
                params.push(("method".into(), "hcaptcha".into()));
                params.push(("sitekey".into(), info.sitekey.clone()));
            }
            CaptchaKind::Turnstile => {
                params.push(("method".into(), "turnstile".into()));
                params.push(("sitekey".into(), info.sitekey.clone()));
            }
        }
        params
    }
}

#[async_trait]
impl CaptchaSolver for TwoCaptcha {
    async fn solve(&self, info: &CaptchaInfo) -> anyhow::Result<Option<String>> {
        let submit: Value = self
            .client
            .post(format!("{}/in.php", self.api_base))
            .form(&self.submit_params(info))
            .send()
            .await?
            .json()
            .await?;

        if submit["status"].as_i64() != Some(1) {
            anyhow::bail!(
                "2Captcha submit failed: {}",
                submit["request"].as_str().unwrap_or("unknown")
            );
        }
        let task_id = submit["request"].as_str().unwrap_or_default().to_string();
        debug!(task_id = %task_id, kind = info.kind.as_str(), "2captcha task submitted");

        for _ in 0..40 {
            tokio::time::sleep(Duration::from_secs(3)).await;

            let result: Value = self
                .client
                .get(format!("{}/res.php", self.api_base))
                .query(&[
                    ("key", self.api_key.as_str()),
                    ("action", "get"),
                    ("id", task_id.as_str()),
                    ("json", "1"),
                ])
                .send()
                .await?
                .json()
                .await?;

            if result["status"].as_i64() == Some(1) {
                return Ok(result["request"].as_str().map(String::from));
            }
            if result["request"].as_str() != Some("CAPCHA_NOT_READY") {
                warn!(
                    response = %result["request"].as_str().unwrap_or("?"),
                    "2captcha error response"
                );
                return Ok(None);
            }
        }

        Ok(None)
    }

    fn name(&self) -> &str {
        "2captcha"
    }
}

// ─────────────────────────────────────────────
// Anti-Captcha
// ─────────────────────────────────────────────

pub struct AntiCaptcha {
    api_key: String,
    api_base: String,
    client: reqwest::Client,
}

impl AntiCaptcha {
    pub fn new(api_key: &str) -> Self {
        Self {
            api_key: api_key.into(),
            api_base: "https://api.anti-captcha.com".into(),
            client: client(),
        }
    }

    #[cfg(test)]
    fn with_base(api_key: &str, base: &str) -> Self {
        let mut s = Self::new(api_key);
        s.api_base = base.into();
        s
    }

    fn task_payload(&self, info: &CaptchaInfo) -> Value {
        let mut task = json!({
            "websiteURL": info.page_url,
            "websiteKey": info.sitekey,
        });
        match info.kind {
            CaptchaKind::RecaptchaV2 => task["type"] = json!("RecaptchaV2TaskProxyless"),
            CaptchaKind::RecaptchaV3 => {
                task["type"] = json!("RecaptchaV3TaskProxyless");
                task["pageAction"] = json!(info.action.clone().unwrap_or_else(|| "verify".into()));
                task["minScore"] = json!(V3_MIN_SCORE);
            }
            CaptchaKind::Hcaptcha => task["type"] = json!("HCaptchaTaskProxyless"),
            CaptchaKind::Turnstile => task["type"] = json!("TurnstileTaskProxyless"),
        }
        task
    }
}

#[async_trait]
impl CaptchaSolver for AntiCaptcha {
    async fn solve(&self, info: &CaptchaInfo) -> anyhow::Result<Option<String>> {
        let create: Value = self
            .client
            .post(format!("{}/createTask", self.api_base))
            .json(&json!({
                "clientKey": self.api_key,
                "task": self.task_payload(info),
            }))
            .send()
            .await?
            .json()
            .await?;

        if create["errorId"].as_i64().unwrap_or(0) != 0 {
            anyhow::bail!(
                "Anti-Captcha createTask failed: {}",
                create["errorDescription"].as_str().unwrap_or("unknown")
            );
        }
        let task_id = create["taskId"]
            .as_i64()
            .ok_or_else(|| anyhow::anyhow!("Anti-Captcha: no taskId in response"))?;

        debug!(task_id = task_id, kind = info.kind.as_str(), "anti-captcha task created");

        for _ in 0..40 {
            tokio::time::sleep(Duration::from_secs(2)).await;

            let result: Value = self
                .client
                .post(format!("{}/getTaskResult", self.api_base))
                .json(&json!({ "clientKey": self.api_key, "taskId": task_id }))
                .send()
                .await?
                .json()
                .await?;

            match result["status"].as_str() {
                Some("ready") => {
                    let token = result["solution"]["gRecaptchaResponse"]
                        .as_str()
                        .or_else(|| result["solution"]["token"].as_str())
                        .map(String::from);
                    return Ok(token);
                }
                Some("processing") | None => continue,
                Some(other) => {
                    warn!(status = other, "anti-captcha unexpected status");
                    return Ok(None);
                }
            }
        }

        Ok(None)
    }

    fn name(&self) -> &str {
        "anticaptcha"
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
