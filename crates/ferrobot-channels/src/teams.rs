//! Microsoft Teams channel — Bot Framework REST API + webhook server.
//!
//! Inbound activities arrive on an axum webhook (`POST /api/messages`,
//! port from `TEAMS_WEBHOOK_PORT`, default 3978). Outbound replies are
//! proactive Bot Framework activities, authenticated with a cached OAuth
//! client-credentials token. Conversation references (`conversationId`,
//! `serviceUrl`) are stored from every incoming activity so replies can be
//! routed later.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use base64::Engine;
use regex::Regex;
use serde_json::{json, Value};
use tokio::sync::{Notify, RwLock};
use tracing::{debug, error, info, warn};

use ferrobot_core::bus::queue::MessageBus;
use ferrobot_core::bus::types::{InboundMessage, OutboundMessage};
use ferrobot_core::config::schema::TeamsConfig;
use ferrobot_core::utils::get_media_path;

use crate::attachments::{mime_for, render_outbound};
use crate::base::{allowlist_permits, Channel};

/// Bot Framework OAuth endpoint.
const BF_AUTH_URL: &str =
    "https://login.microsoftonline.com/botframework.com/oauth2/v2.0/token";

/// Bot Framework OAuth scope.
const BF_SCOPE: &str = "https://api.botframework.com/.default";

/// Fallback service URL when a conversation reference is missing one.
const BF_API_BASE: &str = "https://smba.trafficmanager.net/teams";

/// Safety margin subtracted from `expires_in` when caching tokens.
const TOKEN_MARGIN: Duration = Duration::from_secs(60);

/// Stored routing info for proactive replies.
#[derive(Clone, Debug)]
struct ConversationRef {
    conversation_id: String,
    service_url: String,
}

struct TeamsInner {
    config: TeamsConfig,
    bus: Arc<MessageBus>,
    http: reqwest::Client,
    /// Cached OAuth token and its expiry instant.
    token: RwLock<Option<(String, Instant)>>,
    /// Conversation references keyed by conversation id.
    conversations: RwLock<HashMap<String, ConversationRef>>,
    shutdown: Notify,
}

/// Microsoft Teams channel using the Bot Framework REST API.
pub struct TeamsChannel {
    inner: Arc<TeamsInner>,
}

impl TeamsChannel {
    /// Create a new Teams channel.
    pub fn new(config: TeamsConfig, bus: Arc<MessageBus>) -> Self {
        Self {
            inner: Arc::new(TeamsInner {
                config,
                bus,
                http: reqwest::Client::builder()
                    .timeout(Duration::from_secs(30))
                    .build()
                    .unwrap_or_default(),
                token: RwLock::new(None),
                conversations: RwLock::new(HashMap::new()),
                shutdown: Notify::new(),
            }),
        }
    }

    /// Webhook port from `TEAMS_WEBHOOK_PORT` (default 3978).
    fn webhook_port() -> u16 {
        std::env::var("TEAMS_WEBHOOK_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3978)
    }
}

impl TeamsInner {
    // ─────────────────────────────────────────
    // OAuth
    // ─────────────────────────────────────────

    /// Get or refresh the Bot Framework access token.
    ///
    /// Cached until 60 s before its reported expiry.
    async fn get_access_token(&self) -> Option<String> {
        {
            let guard = self.token.read().await;
            if let Some((token, expires_at)) = guard.as_ref() {
                if Instant::now() + TOKEN_MARGIN < *expires_at {
                    return Some(token.clone());
                }
            }
        }

        let resp = self
            .http
            .post(BF_AUTH_URL)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.config.app_id.as_str()),
                ("client_secret", self.config.app_password.as_str()),
                ("scope", BF_SCOPE),
            ])
            .send()
            .await;

        let data: Value = match resp {
            Ok(r) => match r.json().await {
                Ok(v) => v,
                Err(e) => {
                    error!(error = %e, "teams auth: bad response body");
                    return None;
                }
            },
            Err(e) => {
                error!(error = %e, "teams auth error");
                return None;
            }
        };

        let Some(access_token) = data["access_token"].as_str() else {
            error!(
                detail = %data["error_description"].as_str().unwrap_or("?"),
                "teams auth failed"
            );
            return None;
        };

        let expires_in = data["expires_in"].as_u64().unwrap_or(3600);
        let expires_at = Instant::now() + Duration::from_secs(expires_in);
        {
            let mut guard = self.token.write().await;
            *guard = Some((access_token.to_string(), expires_at));
        }
        debug!("teams access token refreshed");
        Some(access_token.to_string())
    }

    // ─────────────────────────────────────────
    // Inbound
    // ─────────────────────────────────────────

    async fn handle_message_activity(&self, activity: Value) {
        // Keep the reference fresh for proactive replies.
        if let Some(conversation_id) = activity["conversation"]["id"].as_str() {
            let conv_ref = ConversationRef {
                conversation_id: conversation_id.to_string(),
                service_url: activity["serviceUrl"]
                    .as_str()
                    .unwrap_or(BF_API_BASE)
                    .to_string(),
            };
            self.conversations
                .write()
                .await
                .insert(conversation_id.to_string(), conv_ref);
        }

        let sender_id = activity["from"]["id"].as_str().unwrap_or("").to_string();
        let sender_name = activity["from"]["name"].as_str().unwrap_or("").to_string();
        let conversation_id = activity["conversation"]["id"].as_str().unwrap_or("").to_string();
        let activity_id = activity["id"].as_str().unwrap_or("").to_string();
        let raw_text = activity["text"].as_str().unwrap_or("").to_string();

        // Teams embeds the bot @mention in the text; strip it.
        let re_mention = Regex::new(r"<at>[^<]+</at>\s*").unwrap();
        let text = re_mention.replace_all(&raw_text, "").trim().to_string();

        if sender_id.is_empty() || conversation_id.is_empty() || text.is_empty() {
            return;
        }

        if !allowlist_permits(&self.config.allowed_users, &sender_id) {
            warn!(sender = %sender_id, "teams sender not allowed");
            return;
        }

        debug!(sender = %sender_id, name = %sender_name, "teams message");

        let mut content_parts = vec![text];
        let mut media_paths: Vec<String> = Vec::new();

        // Download attachments into the shared media directory.
        if let Some(attachments) = activity["attachments"].as_array() {
            for attachment in attachments {
                let Some(content_url) = attachment["contentUrl"].as_str() else {
                    continue;
                };
                let filename = attachment["name"].as_str().unwrap_or("attachment");

                match self.download_attachment(content_url, filename).await {
                    Ok(path) => {
                        content_parts.push(format!("[attachment: {path}]"));
                        media_paths.push(path);
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to download teams attachment");
                        content_parts.push(format!("[attachment: {filename} - download failed]"));
                    }
                }
            }
        }

        let mut inbound = InboundMessage::new(
            "teams",
            &sender_id,
            &conversation_id,
            content_parts.join("\n"),
        );
        for path in &media_paths {
            inbound.media.push(ferrobot_core::types::MediaAttachment {
                path: path.clone(),
                mime_type: "application/octet-stream".into(),
                filename: None,
                size: None,
            });
        }
        inbound.metadata.insert("reply_to".into(), json!(activity_id));
        inbound.metadata.insert("sender_name".into(), json!(sender_name));

        if let Err(e) = self.bus.publish_inbound(inbound).await {
            error!(error = %e, "failed to publish teams message to bus");
        }
    }

    async fn download_attachment(&self, content_url: &str, filename: &str) -> anyhow::Result<String> {
        let media_dir = get_media_path();
        std::fs::create_dir_all(&media_dir)?;

        let safe_name = filename.replace('/', "_");
        let stamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let file_path = media_dir.join(format!("teams_{stamp}_{safe_name}"));

        let mut req = self.http.get(content_url);
        if let Some(token) = self.get_access_token().await {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?.error_for_status()?;
        let bytes = resp.bytes().await?;
        tokio::fs::write(&file_path, &bytes).await?;

        Ok(file_path.display().to_string())
    }

    // ─────────────────────────────────────────
    // Outbound
    // ─────────────────────────────────────────

    async fn send_outbound(&self, msg: &OutboundMessage) -> anyhow::Result<()> {
        let token = self
            .get_access_token()
            .await
            .ok_or_else(|| anyhow::anyhow!("failed to get Teams access token"))?;

        let conv_ref = {
            let guard = self.conversations.read().await;
            guard.get(&msg.chat_id).cloned()
        };
        let Some(conv_ref) = conv_ref else {
            anyhow::bail!("no conversation reference for chat_id: {}", msg.chat_id);
        };

        let url = format!(
            "{}/v3/conversations/{}/activities",
            conv_ref.service_url.trim_end_matches('/'),
            conv_ref.conversation_id
        );

        let rendered = render_outbound(&msg.content, None);

        if !rendered.text.is_empty() {
            let mut payload = json!({
                "type": "message",
                "text": rendered.text,
                "textFormat": "markdown",
            });
            if let Some(reply_to) = &msg.reply_to {
                payload["replyToId"] = json!(reply_to);
            }

            self.post_activity(&url, &token, &payload).await?;
        }

        for attachment in &rendered.attachments {
            if let Err(e) = self.send_file(&url, &token, &attachment.path, &attachment.filename).await {
                warn!(path = %attachment.path.display(), error = %e, "failed to send teams file");
            }
        }

        Ok(())
    }

    /// POST an activity with up to three attempts, honoring 429 Retry-After.
    async fn post_activity(&self, url: &str, token: &str, payload: &Value) -> anyhow::Result<()> {
        for attempt in 0..3u32 {
            let resp = self
                .http
                .post(url)
                .bearer_auth(token)
                .json(payload)
                .send()
                .await;

            match resp {
                Ok(r) => {
                    let status = r.status();
                    if status.is_success() {
                        return Ok(());
                    }
                    if status.as_u16() == 429 {
                        let retry_after = r
                            .headers()
                            .get("Retry-After")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse::<u64>().ok())
                            .unwrap_or(1);
                        warn!(retry_after, "teams rate limited, retrying");
                        tokio::time::sleep(Duration::from_secs(retry_after)).await;
                        continue;
                    }
                    let body = r.text().await.unwrap_or_default();
                    anyhow::bail!("teams send error: {status} {body}");
                }
                Err(e) if attempt < 2 => {
                    warn!(error = %e, "teams send attempt failed, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        anyhow::bail!("teams send failed after retries")
    }

    /// Send a file as a base64 `contentUrl` attachment activity.
    async fn send_file(
        &self,
        url: &str,
        token: &str,
        path: &std::path::Path,
        filename: &str,
    ) -> anyhow::Result<()> {
        let content_type = mime_for(path);
        let bytes = tokio::fs::read(path).await?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);

        let payload = json!({
            "type": "message",
            "attachments": [{
                "contentType": content_type,
                "contentUrl": format!("data:{content_type};base64,{encoded}"),
                "name": filename,
            }]
        });

        self.post_activity(url, token, &payload).await
    }
}

// ─────────────────────────────────────────────
// Webhook
// ─────────────────────────────────────────────

async fn handle_webhook(
    State(inner): State<Arc<TeamsInner>>,
    Json(body): Json<Value>,
) -> StatusCode {
    match body["type"].as_str() {
        Some("conversationUpdate") => {
            info!("teams: conversation update received");
            if let Some(conversation_id) = body["conversation"]["id"].as_str() {
                let conv_ref = ConversationRef {
                    conversation_id: conversation_id.to_string(),
                    service_url: body["serviceUrl"].as_str().unwrap_or(BF_API_BASE).to_string(),
                };
                inner
                    .conversations
                    .write()
                    .await
                    .insert(conversation_id.to_string(), conv_ref);
            }
            StatusCode::OK
        }
        Some("message") => {
            inner.handle_message_activity(body).await;
            StatusCode::OK
        }
        other => {
            debug!(activity_type = ?other, "teams: ignoring activity type");
            StatusCode::OK
        }
    }
}

// ─────────────────────────────────────────────
// Channel trait implementation
// ─────────────────────────────────────────────

#[async_trait]
impl Channel for TeamsChannel {
    fn name(&self) -> &str {
        "teams"
    }

    fn is_allowed(&self, sender_id: &str) -> bool {
        allowlist_permits(&self.inner.config.allowed_users, sender_id)
    }

    async fn start(&self) -> anyhow::Result<()> {
        if self.inner.config.app_id.is_empty() || self.inner.config.app_password.is_empty() {
            warn!("teams app_id/app_password not configured, channel will not start");
            return Ok(());
        }

        let port = Self::webhook_port();
        let app = Router::new()
            .route("/api/messages", post(handle_webhook))
            .with_state(self.inner.clone());

        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| anyhow::anyhow!("teams: port {port} unavailable: {e}"))?;

        info!(port = port, "teams webhook server started");

        let inner = self.inner.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                inner.shutdown.notified().await;
            })
            .await?;

        info!("teams webhook server stopped");
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.inner.shutdown.notify_waiters();
        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> anyhow::Result<()> {
        self.inner.send_outbound(msg).await
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn make_config() -> TeamsConfig {
        TeamsConfig {
            app_id: "app-guid".into(),
            app_password: "secret".into(),
            allowed_users: Vec::new(),
        }
    }

    fn make_channel() -> (TeamsChannel, Arc<MessageBus>) {
        let bus = Arc::new(MessageBus::new(10));
        (TeamsChannel::new(make_config(), bus.clone()), bus)
    }

    #[test]
    fn test_channel_name() {
        let (ch, _) = make_channel();
        assert_eq!(ch.name(), "teams");
    }

    #[test]
    fn test_webhook_port_default_and_override() {
        std::env::remove_var("TEAMS_WEBHOOK_PORT");
        assert_eq!(TeamsChannel::webhook_port(), 3978);

        std::env::set_var("TEAMS_WEBHOOK_PORT", "4000");
        assert_eq!(TeamsChannel::webhook_port(), 4000);
        std::env::remove_var("TEAMS_WEBHOOK_PORT");
    }

    #[tokio::test]
    async fn test_message_activity_publishes_inbound() {
        let (ch, bus) = make_channel();

        let activity = json!({
            "type": "message",
            "id": "act-1",
            "text": "<at>Ferrobot</at> hello there",
            "from": { "id": "29:user-1", "name": "Ada" },
            "conversation": { "id": "19:conv-1" },
            "serviceUrl": "https://smba.trafficmanager.net/emea/"
        });

        ch.inner.handle_message_activity(activity).await;

        let msg = bus.consume_inbound(Duration::from_millis(200)).await.unwrap();
        assert_eq!(msg.channel, "teams");
        assert_eq!(msg.sender_id, "29:user-1");
        assert_eq!(msg.chat_id, "19:conv-1");
        // Mention stripped from inbound text.
        assert_eq!(msg.content, "hello there");
        assert_eq!(msg.meta_str("reply_to"), Some("act-1"));
    }

    #[tokio::test]
    async fn test_message_activity_stores_conversation_ref() {
        let (ch, _bus) = make_channel();

        let activity = json!({
            "type": "message",
            "id": "act-1",
            "text": "hi",
            "from": { "id": "29:user-1", "name": "Ada" },
            "conversation": { "id": "19:conv-1" },
            "serviceUrl": "https://smba.trafficmanager.net/emea/"
        });

        ch.inner.handle_message_activity(activity).await;

        let refs = ch.inner.conversations.read().await;
        let conv = refs.get("19:conv-1").unwrap();
        assert_eq!(conv.service_url, "https://smba.trafficmanager.net/emea/");
    }

    #[tokio::test]
    async fn test_empty_text_ignored() {
        let (ch, bus) = make_channel();

        let activity = json!({
            "type": "message",
            "id": "act-1",
            "text": "<at>Ferrobot</at>",
            "from": { "id": "29:user-1" },
            "conversation": { "id": "19:conv-1" }
        });

        ch.inner.handle_message_activity(activity).await;
        assert!(bus.consume_inbound(Duration::from_millis(50)).await.is_none());
    }

    #[tokio::test]
    async fn test_disallowed_sender_ignored() {
        let bus = Arc::new(MessageBus::new(10));
        let mut cfg = make_config();
        cfg.allowed_users = vec!["29:allowed".into()];
        let ch = TeamsChannel::new(cfg, bus.clone());

        let activity = json!({
            "type": "message",
            "id": "act-1",
            "text": "hello",
            "from": { "id": "29:stranger" },
            "conversation": { "id": "19:conv-1" }
        });

        ch.inner.handle_message_activity(activity).await;
        assert!(bus.consume_inbound(Duration::from_millis(50)).await.is_none());
    }

    #[tokio::test]
    async fn test_send_without_conversation_ref_fails() {
        let (ch, _bus) = make_channel();
        // Seed a token so send() reaches the reference lookup.
        {
            let mut guard = ch.inner.token.write().await;
            *guard = Some(("tok".into(), Instant::now() + Duration::from_secs(600)));
        }

        let msg = OutboundMessage::new("teams", "19:unknown", "hello");
        let result = ch.send(&msg).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("conversation reference"));
    }

    #[tokio::test]
    async fn test_cached_token_reused_within_margin() {
        let (ch, _bus) = make_channel();
        {
            let mut guard = ch.inner.token.write().await;
            *guard = Some(("cached-token".into(), Instant::now() + Duration::from_secs(600)));
        }
        let token = ch.inner.get_access_token().await;
        assert_eq!(token.as_deref(), Some("cached-token"));
    }
}
