//! The `browser` tool: one lazily-launched stealth Chromium session,
//! driven through the Chrome DevTools Protocol.
//!
//! All actions serialize through the session mutex; every action retries
//! once with a 500 ms backoff and tags errors with the current URL.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::{
    MediaFeature, SetDeviceMetricsOverrideParams, SetEmulatedMediaParams,
    SetTimezoneOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::network::{Headers, SetExtraHttpHeadersParams};
use chromiumoxide::layout::Point;
use chromiumoxide::page::{Page, ScreenshotParams};
use chromiumoxide::element::Element;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use ferrobot_core::tool::{optional_bool, optional_i64, optional_string, require_string, Tool};

use crate::captcha::{self, CaptchaInfo};
use crate::fingerprint::Fingerprint;
use crate::humanize;
use crate::solvers::CaptchaSolver;
use crate::stealth::stealth_script;

/// Navigation timeout.
const NAV_TIMEOUT: Duration = Duration::from_secs(60);
/// Selector wait timeout.
const SELECTOR_TIMEOUT: Duration = Duration::from_secs(10);
/// Explicit `wait` action cap.
const WAIT_CAP_SECS: i64 = 15;
/// Retry backoff for transient action failures.
const RETRY_BACKOFF: Duration = Duration::from_millis(500);
/// Truncation limit for content/extract output.
const CONTENT_LIMIT: usize = 10_000;

/// Cookie-banner dismissal selectors, tried in order after navigation.
const COOKIE_SELECTORS: &[&str] = &[
    "#onetrust-accept-btn-handler",
    "#didomi-notice-agree-button",
    "button#accept",
    "button#acceptCookies",
    "#cookie-accept",
    ".cc-allow",
    "button.fc-cta-consent",
    "[aria-label=\"Accept all\"]",
    "[aria-label=\"Accept cookies\"]",
    "button[data-testid=\"cookie-policy-manage-dialog-accept-button\"]",
];

/// One live browser session.
struct BrowserSession {
    #[allow(dead_code)]
    browser: Browser,
    page: Page,
    fingerprint: Fingerprint,
    handler_task: tokio::task::JoinHandle<()>,
    /// Last cursor position, so consecutive moves chain naturally.
    cursor: (f64, f64),
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        self.handler_task.abort();
    }
}

/// Stealth browser automation tool.
pub struct BrowserTool {
    workspace: PathBuf,
    solver: Option<Box<dyn CaptchaSolver>>,
    proxy_url: Option<String>,
    session: Mutex<Option<BrowserSession>>,
}

impl BrowserTool {
    /// Create a browser tool. The browser launches on first use.
    pub fn new(
        workspace: PathBuf,
        solver: Option<Box<dyn CaptchaSolver>>,
        proxy_url: Option<String>,
    ) -> Self {
        Self {
            workspace,
            solver,
            proxy_url,
            session: Mutex::new(None),
        }
    }

    // ─────────────────────────────────────────
    // Session lifecycle
    // ─────────────────────────────────────────

    async fn ensure_session(
        &self,
        guard: &mut Option<BrowserSession>,
    ) -> anyhow::Result<()> {
        if guard.is_some() {
            return Ok(());
        }

        let fp = Fingerprint::random();
        info!(
            ua = %fp.user_agent,
            viewport = format!("{}x{}", fp.viewport_width, fp.viewport_height),
            tz = %fp.timezone,
            "launching stealth browser"
        );

        let mut builder = BrowserConfig::builder()
            .window_size(fp.viewport_width, fp.viewport_height)
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--no-first-run")
            .arg("--disable-infobars")
            .arg("--lang=en-US");
        if let Some(proxy) = &self.proxy_url {
            builder = builder.arg(format!("--proxy-server={proxy}"));
        }
        let config = builder
            .build()
            .map_err(|e| anyhow::anyhow!("browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(config).await?;
        let handler_task = tokio::task::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let page = browser.new_page("about:blank").await?;

        // Fingerprint surfaces: UA + client hints, timezone, metrics,
        // color scheme, and the pre-navigation stealth script.
        page.set_user_agent(fp.user_agent.as_str()).await?;
        page.execute(SetTimezoneOverrideParams::new(fp.timezone.clone()))
            .await?;
        page.execute(SetDeviceMetricsOverrideParams::new(
            fp.viewport_width as i64,
            fp.viewport_height as i64,
            fp.device_scale,
            false,
        ))
        .await?;
        page.execute(SetExtraHttpHeadersParams::new(Headers::new(json!({
            "Accept-Language": "en-US,en;q=0.9",
            "Sec-CH-UA": fp.sec_ch_ua,
            "Sec-CH-UA-Platform": format!("\"{}\"", fp.platform),
            "Sec-CH-UA-Mobile": "?0",
        }))))
        .await?;
        if fp.color_scheme == "dark" {
            page.execute(SetEmulatedMediaParams {
                media: None,
                features: Some(vec![MediaFeature {
                    name: "prefers-color-scheme".into(),
                    value: "dark".into(),
                }]),
            })
            .await?;
        }
        page.evaluate_on_new_document(stealth_script(&fp)).await?;

        let cursor = fp.random_point_in_viewport();
        *guard = Some(BrowserSession {
            browser,
            page,
            fingerprint: fp,
            handler_task,
            cursor,
        });
        Ok(())
    }

    // ─────────────────────────────────────────
    // Element helpers
    // ─────────────────────────────────────────

    /// Poll for a selector until it appears or [`SELECTOR_TIMEOUT`] passes.
    async fn wait_for_selector(page: &Page, selector: &str) -> anyhow::Result<Element> {
        let deadline = tokio::time::Instant::now() + SELECTOR_TIMEOUT;
        loop {
            if let Ok(el) = page.find_element(selector).await {
                return Ok(el);
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("selector '{selector}' not found within {}s", SELECTOR_TIMEOUT.as_secs());
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    /// Move the cursor along a Bézier path and click the element.
    async fn human_click(session: &mut BrowserSession, selector: &str) -> anyhow::Result<()> {
        let element = Self::wait_for_selector(&session.page, selector).await?;
        let _ = element.scroll_into_view().await;
        let target = element.clickable_point().await?;
        Self::human_click_point(session, target).await
    }

    async fn human_click_point(session: &mut BrowserSession, target: Point) -> anyhow::Result<()> {
        let start = humanize::Point {
            x: session.cursor.0,
            y: session.cursor.1,
        };
        let end = humanize::Point {
            x: target.x,
            y: target.y,
        };

        for step in humanize::mouse_path(start, end) {
            session
                .page
                .move_mouse(Point::new(step.point.x, step.point.y))
                .await?;
            tokio::time::sleep(step.dwell).await;
        }

        session.page.click(target).await?;
        session.cursor = (target.x, target.y);
        tokio::time::sleep(humanize::action_delay()).await;
        Ok(())
    }

    async fn current_url(page: &Page) -> String {
        page.url()
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| "about:blank".into())
    }

    // ─────────────────────────────────────────
    // Navigation + CAPTCHA pipeline
    // ─────────────────────────────────────────

    async fn goto(&self, session: &mut BrowserSession, url: &str) -> anyhow::Result<String> {
        tokio::time::timeout(NAV_TIMEOUT, session.page.goto(url))
            .await
            .map_err(|_| anyhow::anyhow!("navigation timed out after {}s", NAV_TIMEOUT.as_secs()))?
            .map_err(|e| anyhow::anyhow!("navigation failed: {e}"))?;

        let _ = tokio::time::timeout(Duration::from_secs(5), session.page.wait_for_navigation()).await;

        self.dismiss_cookie_banner(&session.page).await;

        // Auto-run the CAPTCHA pipeline when a solver is configured.
        let captcha_status = if self.solver.is_some() {
            match self.solve_captcha_pipeline(session).await {
                Ok(status) => format!(" ({status})"),
                Err(e) => {
                    warn!(error = %e, "captcha pipeline failed");
                    format!(" (captcha solving failed: {e})")
                }
            }
        } else {
            match self.detect_captcha(&session.page).await? {
                Some(info) => format!(
                    " (warning: {} challenge detected, no solver configured)",
                    info.kind.as_str()
                ),
                None => String::new(),
            }
        };

        Ok(format!("Navigated to {url}{captcha_status}"))
    }

    /// Click the first visible cookie-consent button, if any.
    async fn dismiss_cookie_banner(&self, page: &Page) {
        let selectors = serde_json::to_string(COOKIE_SELECTORS).unwrap_or_default();
        let script = format!(
            r#"(() => {{
                for (const sel of {selectors}) {{
                    const el = document.querySelector(sel);
                    if (el && el.offsetParent !== null) {{ el.click(); return sel; }}
                }}
                return null;
            }})()"#
        );
        if let Ok(result) = page.evaluate(script).await {
            if let Some(sel) = result.value().and_then(|v| v.as_str()) {
                debug!(selector = sel, "dismissed cookie banner");
            }
        }
    }

    async fn detect_captcha(&self, page: &Page) -> anyhow::Result<Option<CaptchaInfo>> {
        let result = page.evaluate(captcha::DETECT_SCRIPT).await?;
        Ok(result.into_value::<Option<CaptchaInfo>>().unwrap_or(None))
    }

    /// Detect → solve → inject. Returns a human-readable status.
    async fn solve_captcha_pipeline(&self, session: &mut BrowserSession) -> anyhow::Result<String> {
        let Some(info) = self.detect_captcha(&session.page).await? else {
            return Ok("no captcha detected".into());
        };

        let Some(solver) = &self.solver else {
            return Ok(format!("{} detected, no solver configured", info.kind.as_str()));
        };

        info!(
            kind = info.kind.as_str(),
            sitekey = %info.sitekey,
            provider = solver.name(),
            "solving captcha"
        );

        let Some(token) = solver.solve(&info).await? else {
            return Ok(format!("{} detected, solver gave up", info.kind.as_str()));
        };

        session.page.evaluate(captcha::inject_script(&token)).await?;
        tokio::time::sleep(Duration::from_secs(2)).await;
        let _ = tokio::time::timeout(Duration::from_secs(5), session.page.wait_for_navigation()).await;

        Ok(format!("{} solved", info.kind.as_str()))
    }

    // ─────────────────────────────────────────
    // Action dispatch
    // ─────────────────────────────────────────

    async fn run_action(
        &self,
        session: &mut BrowserSession,
        action: &str,
        params: &HashMap<String, Value>,
    ) -> anyhow::Result<String> {
        match action {
            "goto" => {
                let url = require_string(params, "url")?;
                self.goto(session, &url).await
            }

            "click" => {
                let selector = require_string(params, "selector")?;
                Self::human_click(session, &selector).await?;
                Ok(format!("Clicked {selector}"))
            }

            "type" => {
                let selector = require_string(params, "selector")?;
                let text = require_string(params, "text")?;
                Self::human_click(session, &selector).await?;
                let element = Self::wait_for_selector(&session.page, &selector).await?;
                element.type_str(&text).await?;
                Ok(format!("Typed into {selector}"))
            }

            "type_slowly" => {
                let selector = require_string(params, "selector")?;
                let text = require_string(params, "text")?;
                Self::human_click(session, &selector).await?;
                let element = Self::wait_for_selector(&session.page, &selector).await?;
                for ch in text.chars() {
                    element.type_str(ch.to_string()).await?;
                    tokio::time::sleep(humanize::typing_delay()).await;
                }
                Ok(format!("Typed {} characters into {selector}", text.chars().count()))
            }

            "find_text" => {
                let text = require_string(params, "text")?;
                self.find_text(session, &text).await
            }

            "hover" => {
                let selector = require_string(params, "selector")?;
                let element = Self::wait_for_selector(&session.page, &selector).await?;
                let _ = element.scroll_into_view().await;
                let target = element.clickable_point().await?;
                let start = humanize::Point {
                    x: session.cursor.0,
                    y: session.cursor.1,
                };
                let end = humanize::Point {
                    x: target.x,
                    y: target.y,
                };
                for step in humanize::mouse_path(start, end) {
                    session
                        .page
                        .move_mouse(Point::new(step.point.x, step.point.y))
                        .await?;
                    tokio::time::sleep(step.dwell).await;
                }
                session.cursor = (target.x, target.y);
                Ok(format!("Hovering over {selector}"))
            }

            "press" => {
                let key = require_string(params, "key")?;
                let selector = optional_string(params, "selector");
                let element = match selector {
                    Some(sel) => Self::wait_for_selector(&session.page, &sel).await?,
                    None => {
                        // Fall back to the focused element, then body.
                        match session.page.find_element(":focus").await {
                            Ok(el) => el,
                            Err(_) => Self::wait_for_selector(&session.page, "body").await?,
                        }
                    }
                };
                element.press_key(&key).await?;
                Ok(format!("Pressed {key}"))
            }

            "select_option" => {
                let selector = require_string(params, "selector")?;
                let value = require_string(params, "value")?;
                let sel_json = serde_json::to_string(&selector)?;
                let val_json = serde_json::to_string(&value)?;
                let script = format!(
                    r#"(() => {{
                        const el = document.querySelector({sel_json});
                        if (!el) return false;
                        el.value = {val_json};
                        el.dispatchEvent(new Event('change', {{ bubbles: true }}));
                        return true;
                    }})()"#
                );
                let result = session.page.evaluate(script).await?;
                if result.value().and_then(|v| v.as_bool()) == Some(true) {
                    Ok(format!("Selected '{value}' in {selector}"))
                } else {
                    anyhow::bail!("select element '{selector}' not found")
                }
            }

            "wait" => {
                let secs = optional_i64(params, "seconds").unwrap_or(1).clamp(0, WAIT_CAP_SECS);
                tokio::time::sleep(Duration::from_secs(secs as u64)).await;
                Ok(format!("Waited {secs}s"))
            }

            "evaluate" => {
                let script = require_string(params, "script")?;
                let result = session.page.evaluate(script).await?;
                match result.value() {
                    Some(v) => Ok(serde_json::to_string(v)?),
                    None => Ok("undefined".into()),
                }
            }

            "screenshot" => {
                let full_page = optional_bool(params, "full_page");
                let dir = self.workspace.join("screenshots");
                std::fs::create_dir_all(&dir)?;
                let ts = chrono_free_timestamp();
                let path = dir.join(format!("screenshot_{ts}.png"));
                session
                    .page
                    .save_screenshot(
                        ScreenshotParams::builder().full_page(full_page).build(),
                        &path,
                    )
                    .await?;
                Ok(format!("Screenshot saved to screenshots/screenshot_{ts}.png"))
            }

            "extract" => {
                let result = session
                    .page
                    .evaluate("document.body ? document.body.innerText : ''")
                    .await?;
                let text = result.value().and_then(|v| v.as_str()).unwrap_or("").to_string();
                Ok(truncate(text))
            }

            "content" => {
                let html = session.page.content().await?;
                Ok(truncate(html))
            }

            "url" => Ok(Self::current_url(&session.page).await),

            "scroll" => {
                let direction = optional_string(params, "direction").unwrap_or_else(|| "down".into());
                let amount = optional_i64(params, "amount").unwrap_or(500);
                let delta = if direction == "up" { -amount } else { amount };
                session
                    .page
                    .evaluate(format!("window.scrollBy(0, {delta})"))
                    .await?;
                Ok(format!("Scrolled {direction} by {amount} pixels"))
            }

            "back" => {
                session.page.evaluate("history.back()").await?;
                let _ = tokio::time::timeout(Duration::from_secs(5), session.page.wait_for_navigation())
                    .await;
                Ok("Navigated back".into())
            }

            "forward" => {
                session.page.evaluate("history.forward()").await?;
                let _ = tokio::time::timeout(Duration::from_secs(5), session.page.wait_for_navigation())
                    .await;
                Ok("Navigated forward".into())
            }

            "reload" => {
                session.page.reload().await?;
                Ok("Reloaded page".into())
            }

            "fill_form" => {
                let fields = params
                    .get("fields")
                    .and_then(|v| v.as_object())
                    .ok_or_else(|| anyhow::anyhow!("'fields' object is required for fill_form"))?
                    .clone();
                let mut filled = 0usize;
                for (selector, value) in &fields {
                    let text = value.as_str().unwrap_or_default();
                    Self::human_click(session, selector).await?;
                    let element = Self::wait_for_selector(&session.page, selector).await?;
                    element.type_str(text).await?;
                    tokio::time::sleep(humanize::action_delay()).await;
                    filled += 1;
                }
                Ok(format!("Filled {filled} form field(s)"))
            }

            "solve_captcha" => self.solve_captcha_pipeline(session).await,

            other => anyhow::bail!("Unknown browser action '{other}'"),
        }
    }

    /// Find and click an element by its visible text: exact text match
    /// first, then links, then buttons.
    async fn find_text(&self, session: &mut BrowserSession, text: &str) -> anyhow::Result<String> {
        let text_json = serde_json::to_string(text)?;
        let script = format!(
            r#"(() => {{
                const needle = {text_json}.trim().toLowerCase();
                const match = (el) =>
                    el.offsetParent !== null &&
                    (el.innerText || '').trim().toLowerCase().includes(needle);

                const pools = [
                    Array.from(document.querySelectorAll('a, button, [role], input[type=submit], span, div, p, li, h1, h2, h3')),
                    Array.from(document.querySelectorAll('a, [role="link"]')),
                    Array.from(document.querySelectorAll('button, [role="button"]')),
                ];
                for (const pool of pools) {{
                    const el = pool.find(match);
                    if (el) {{
                        const r = el.getBoundingClientRect();
                        return {{ x: r.x + r.width / 2, y: r.y + r.height / 2, tag: el.tagName }};
                    }}
                }}
                return null;
            }})()"#
        );

        let result = session.page.evaluate(script).await?;
        let Some(hit) = result.value().cloned() else {
            anyhow::bail!("no element with text '{text}' found");
        };
        if hit.is_null() {
            anyhow::bail!("no element with text '{text}' found");
        }

        let x = hit["x"].as_f64().unwrap_or(0.0);
        let y = hit["y"].as_f64().unwrap_or(0.0);
        let tag = hit["tag"].as_str().unwrap_or("?").to_lowercase();

        Self::human_click_point(session, Point::new(x, y)).await?;
        Ok(format!("Clicked <{tag}> containing '{text}'"))
    }

    /// Close the browser session, if one is running.
    pub async fn close(&self) {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.take() {
            let _ = session.page.evaluate("window.close()").await;
            drop(session);
            info!("browser session closed");
        }
    }
}

fn truncate(mut s: String) -> String {
    if s.len() > CONTENT_LIMIT {
        s.truncate(CONTENT_LIMIT);
        s.push_str("...");
    }
    s
}

/// Millisecond timestamp for screenshot filenames.
fn chrono_free_timestamp() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

#[async_trait]
impl Tool for BrowserTool {
    fn name(&self) -> &str {
        "browser"
    }

    fn description(&self) -> &str {
        "Control a stealth web browser. Useful for interacting with complex websites, \
         taking screenshots, filling forms, or automating web tasks. \
         Captchas are detected and solved automatically when a solver is configured."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": [
                        "goto", "click", "type", "type_slowly", "find_text", "hover",
                        "press", "select_option", "wait", "evaluate", "screenshot",
                        "extract", "content", "url", "scroll", "back", "forward",
                        "reload", "fill_form", "solve_captcha"
                    ],
                    "description": "The action to perform"
                },
                "url": { "type": "string", "description": "URL for 'goto'" },
                "selector": { "type": "string", "description": "CSS selector for element actions" },
                "text": { "type": "string", "description": "Text for 'type'/'type_slowly'/'find_text'" },
                "key": { "type": "string", "description": "Key for 'press' (e.g. 'Enter')" },
                "value": { "type": "string", "description": "Option value for 'select_option'" },
                "script": { "type": "string", "description": "JavaScript for 'evaluate'" },
                "seconds": { "type": "integer", "description": "Seconds for 'wait' (max 15)" },
                "full_page": { "type": "boolean", "description": "Full-page screenshot", "default": false },
                "direction": { "type": "string", "enum": ["up", "down"], "description": "Scroll direction", "default": "down" },
                "amount": { "type": "integer", "description": "Scroll amount in pixels", "default": 500 },
                "fields": { "type": "object", "description": "selector -> value map for 'fill_form'" }
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, params: HashMap<String, Value>) -> anyhow::Result<String> {
        let action = require_string(&params, "action")?;

        let mut guard = self.session.lock().await;
        self.ensure_session(&mut guard).await?;
        let session = guard.as_mut().expect("session initialized above");

        debug!(
            action = %action,
            viewport = format!(
                "{}x{}",
                session.fingerprint.viewport_width, session.fingerprint.viewport_height
            ),
            "browser action"
        );

        match self.run_action(session, &action, &params).await {
            Ok(result) => Ok(result),
            Err(first) => {
                // One retry for transient failures (detached frames, slow
                // renders), then surface the original error with the URL.
                tokio::time::sleep(RETRY_BACKOFF).await;
                match self.run_action(session, &action, &params).await {
                    Ok(result) => Ok(result),
                    Err(_) => {
                        let url = Self::current_url(&session.page).await;
                        anyhow::bail!("({url}) {first}")
                    }
                }
            }
        }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
