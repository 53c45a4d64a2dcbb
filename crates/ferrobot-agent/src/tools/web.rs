//! Web tools — search (Brave API) and fetch (HTTP content extraction).

use std::collections::HashMap;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use ferrobot_core::tool::{optional_i64, require_string, Tool};

/// User-Agent header for outgoing requests.
const USER_AGENT: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_7_2) AppleWebKit/537.36 (KHTML, like Gecko)";

/// Max chars for fetched content.
const DEFAULT_MAX_CHARS: usize = 50_000;

/// Max search results.
const DEFAULT_MAX_RESULTS: usize = 5;

// ─────────────────────────────────────────────
// WebSearchTool (Brave API)
// ─────────────────────────────────────────────

/// Searches the web using the Brave Search API.
pub struct WebSearchTool {
    api_key: Option<String>,
    client: Client,
}

impl WebSearchTool {
    /// Create a new web search tool.
    ///
    /// `api_key` can be `None`; it falls back to the `BRAVE_API_KEY` env var.
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key,
            client: Client::builder().user_agent(USER_AGENT).build().unwrap_or_default(),
        }
    }

    fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var("BRAVE_API_KEY").ok())
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web using Brave Search API. Returns a numbered list of results with titles, URLs, and descriptions."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query"
                },
                "count": {
                    "type": "integer",
                    "description": "Number of results (1-10, default 5)",
                    "minimum": 1,
                    "maximum": 10
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: HashMap<String, Value>) -> anyhow::Result<String> {
        let query = require_string(&params, "query")?;
        let count = optional_i64(&params, "count").unwrap_or(DEFAULT_MAX_RESULTS as i64) as usize;
        let count = count.clamp(1, 10);

        let api_key = self
            .resolve_api_key()
            .ok_or_else(|| anyhow::anyhow!("No Brave API key configured (set BRAVE_API_KEY)"))?;

        debug!(query = %query, count = count, "searching web");

        let resp = self
            .client
            .get("https://api.search.brave.com/res/v1/web/search")
            .header("X-Subscription-Token", &api_key)
            .query(&[("q", &query), ("count", &count.to_string())])
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Brave API request failed: {e}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Brave API returned {status}: {body}");
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to parse Brave response: {e}"))?;

        let results = body["web"]["results"].as_array().cloned().unwrap_or_default();

        if results.is_empty() {
            return Ok("No results found.".into());
        }

        let mut output = Vec::new();
        for (i, r) in results.iter().enumerate() {
            let title = r["title"].as_str().unwrap_or("(no title)");
            let url = r["url"].as_str().unwrap_or("");
            let desc = r["description"].as_str().unwrap_or("");
            output.push(format!("{}. {}\n   {}\n   {}", i + 1, title, url, desc));
        }

        Ok(output.join("\n\n"))
    }
}

// ─────────────────────────────────────────────
// WebFetchTool
// ─────────────────────────────────────────────

/// Fetches a web page and extracts readable text.
pub struct WebFetchTool {
    client: Client,
}

impl WebFetchTool {
    pub fn new() -> Self {
        Self {
            client: Client::builder()
                .user_agent(USER_AGENT)
                .redirect(reqwest::redirect::Policy::limited(5))
                .build()
                .unwrap_or_default(),
        }
    }

    /// Strip tags and collapse whitespace from an HTML document.
    fn extract_text(html: &str) -> String {
        // Drop script/style bodies before stripping tags.
        let re_script = Regex::new(r"(?si)<(script|style|noscript)[^>]*>.*?</(script|style|noscript)>").unwrap();
        let text = re_script.replace_all(html, " ");

        let re_tags = Regex::new(r"<[^>]+>").unwrap();
        let text = re_tags.replace_all(&text, " ");

        let text = text
            .replace("&nbsp;", " ")
            .replace("&amp;", "&")
            .replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&quot;", "\"")
            .replace("&#39;", "'");

        let re_space = Regex::new(r"\s+").unwrap();
        re_space.replace_all(&text, " ").trim().to_string()
    }
}

impl Default for WebFetchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch a URL and return its readable text content (HTML stripped)."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The URL to fetch"
                },
                "max_chars": {
                    "type": "integer",
                    "description": "Maximum characters to return (default 50000)"
                }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, params: HashMap<String, Value>) -> anyhow::Result<String> {
        let url = require_string(&params, "url")?;
        let max_chars = optional_i64(&params, "max_chars").unwrap_or(DEFAULT_MAX_CHARS as i64) as usize;

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Fetch failed for {url}: {e}"))?;

        if !resp.status().is_success() {
            anyhow::bail!("Fetch returned {} for {url}", resp.status());
        }

        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let body = resp
            .text()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read body from {url}: {e}"))?;

        let mut text = if content_type.contains("text/html") {
            Self::extract_text(&body)
        } else {
            body
        };

        if text.len() > max_chars {
            text.truncate(max_chars);
            text.push_str("\n... (content truncated)");
        }

        Ok(text)
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
