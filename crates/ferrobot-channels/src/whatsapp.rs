//! WhatsApp channel — websocket client to an out-of-process bridge.
//!
//! A Node.js bridge speaks the WhatsApp Web protocol; this adapter connects
//! to it as a websocket client and exchanges JSON frames:
//! `message`, `status`, `qr` inbound; `send`, `send_image`, `send_audio`,
//! `send_video`, `send_document`, `typing` outbound.
//!
//! A typing repeater re-sends `composing` every 4 s while the agent works
//! and emits `paused` once the reply has gone out. Pairing QR frames are
//! written to `{workspace}/whatsapp_qr.txt` and the file is removed when
//! the bridge reports `status=connected`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use ferrobot_core::bus::queue::MessageBus;
use ferrobot_core::bus::types::{InboundMessage, OutboundMessage};

use crate::attachments::{mime_for, render_outbound, AttachmentKind};
use crate::base::{allowlist_permits, Channel};

/// Default bridge WebSocket URL.
const DEFAULT_BRIDGE_URL: &str = "ws://localhost:3001";

/// Reconnect backoff (seconds).
const RECONNECT_DELAY_SECS: u64 = 5;

/// Typing repeater cadence.
const TYPING_INTERVAL_SECS: u64 = 4;

type WsSender = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    tokio_tungstenite::tungstenite::Message,
>;

/// WhatsApp channel — connects to a bridge via WebSocket.
pub struct WhatsAppChannel {
    bridge_url: String,
    bus: Arc<MessageBus>,
    workspace: Option<PathBuf>,
    /// Allowlist of phone numbers (the part before `@`).
    allowed_users: Vec<String>,
    shutdown: Arc<Notify>,
    ws_write: Arc<Mutex<Option<WsSender>>>,
    connected: Arc<Mutex<bool>>,
    /// Active typing repeaters keyed by chat id.
    typing_tasks: Arc<Mutex<HashMap<String, tokio::task::JoinHandle<()>>>>,
}

impl WhatsAppChannel {
    /// Create a new WhatsApp channel.
    pub fn new(
        bridge_url: String,
        bus: Arc<MessageBus>,
        allowed_users: Vec<String>,
        workspace: Option<PathBuf>,
    ) -> Self {
        let url = if bridge_url.is_empty() {
            DEFAULT_BRIDGE_URL.to_string()
        } else {
            bridge_url
        };

        Self {
            bridge_url: url,
            bus,
            workspace,
            allowed_users,
            shutdown: Arc::new(Notify::new()),
            ws_write: Arc::new(Mutex::new(None)),
            connected: Arc::new(Mutex::new(false)),
            typing_tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn qr_path(&self) -> Option<PathBuf> {
        self.workspace.as_ref().map(|ws| ws.join("whatsapp_qr.txt"))
    }

    /// Send a raw JSON frame to the bridge.
    async fn send_frame(&self, frame: Value) -> anyhow::Result<()> {
        use futures_util::SinkExt;
        use tokio_tungstenite::tungstenite::Message as WsMessage;

        let mut guard = self.ws_write.lock().await;
        let write = guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("whatsapp bridge not connected"))?;
        write.send(WsMessage::text(frame.to_string())).await?;
        Ok(())
    }

    // ─────────────────────────────────────────
    // Typing indicator
    // ─────────────────────────────────────────

    /// Start the `composing` repeater for a chat.
    async fn start_typing(&self, chat_id: &str) {
        self.stop_typing(chat_id, false).await;

        let ws_write = self.ws_write.clone();
        let chat = chat_id.to_string();

        let handle = tokio::spawn(async move {
            loop {
                {
                    use futures_util::SinkExt;
                    use tokio_tungstenite::tungstenite::Message as WsMessage;

                    let frame = json!({
                        "type": "typing",
                        "to": chat,
                        "state": "composing"
                    })
                    .to_string();

                    let mut guard = ws_write.lock().await;
                    match guard.as_mut() {
                        Some(write) => {
                            if write.send(WsMessage::text(frame)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                tokio::time::sleep(std::time::Duration::from_secs(TYPING_INTERVAL_SECS)).await;
            }
        });

        let mut tasks = self.typing_tasks.lock().await;
        tasks.insert(chat_id.to_string(), handle);
    }

    /// Stop the repeater; optionally emit a `paused` state.
    async fn stop_typing(&self, chat_id: &str, emit_paused: bool) {
        let handle = {
            let mut tasks = self.typing_tasks.lock().await;
            tasks.remove(chat_id)
        };
        if let Some(handle) = handle {
            handle.abort();
        }

        if emit_paused {
            let _ = self
                .send_frame(json!({
                    "type": "typing",
                    "to": chat_id,
                    "state": "paused"
                }))
                .await;
        }
    }

    // ─────────────────────────────────────────
    // Bridge session
    // ─────────────────────────────────────────

    async fn run_bridge_loop(&self) -> anyhow::Result<()> {
        loop {
            match self.bridge_session().await {
                Ok(()) => {
                    info!("whatsapp bridge session ended");
                    break;
                }
                Err(e) => {
                    *self.connected.lock().await = false;
                    *self.ws_write.lock().await = None;
                    warn!(error = %e, "whatsapp bridge error, reconnecting in {RECONNECT_DELAY_SECS}s");
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_secs(RECONNECT_DELAY_SECS)) => {}
                        _ = self.shutdown.notified() => return Ok(()),
                    }
                }
            }
        }
        Ok(())
    }

    async fn bridge_session(&self) -> anyhow::Result<()> {
        use futures_util::{SinkExt, StreamExt};
        use tokio_tungstenite::tungstenite::Message as WsMessage;

        debug!(url = %self.bridge_url, "connecting to whatsapp bridge");
        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.bridge_url).await?;
        info!("connected to whatsapp bridge");

        let (write, mut read) = ws_stream.split();
        *self.ws_write.lock().await = Some(write);

        loop {
            tokio::select! {
                msg = read.next() => {
                    let msg = match msg {
                        Some(Ok(m)) => m,
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(()),
                    };

                    let text = match msg {
                        WsMessage::Text(t) => t.to_string(),
                        WsMessage::Close(_) => {
                            info!("whatsapp bridge closed connection");
                            return Ok(());
                        }
                        _ => continue,
                    };

                    if let Err(e) = self.handle_bridge_message(&text).await {
                        warn!(error = %e, "failed to handle bridge message");
                    }
                }
                _ = self.shutdown.notified() => {
                    if let Some(mut write) = self.ws_write.lock().await.take() {
                        let _ = write.send(WsMessage::Close(None)).await;
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Parse and handle a JSON frame from the bridge.
    async fn handle_bridge_message(&self, raw: &str) -> anyhow::Result<()> {
        let payload: Value = serde_json::from_str(raw)?;
        let msg_type = payload["type"].as_str().unwrap_or("");

        match msg_type {
            "message" => {
                self.handle_incoming_message(&payload).await;
            }
            "status" => {
                let status = payload["status"].as_str().unwrap_or("unknown");
                let now_connected = status == "connected";
                *self.connected.lock().await = now_connected;

                if now_connected {
                    info!("whatsapp bridge: connected to WhatsApp");
                    // Pairing done: drop the QR file.
                    if let Some(qr_path) = self.qr_path() {
                        if qr_path.exists() {
                            if std::fs::remove_file(&qr_path).is_ok() {
                                info!("whatsapp QR code file removed");
                            }
                        }
                    }
                } else {
                    debug!(status = status, "whatsapp bridge status update");
                }
            }
            "qr" => {
                if let (Some(qr), Some(qr_path)) = (payload["qr"].as_str(), self.qr_path()) {
                    match std::fs::write(&qr_path, qr) {
                        Ok(()) => info!(path = %qr_path.display(), "whatsapp QR code written"),
                        Err(e) => error!(error = %e, "failed to write whatsapp QR code"),
                    }
                }
                info!("whatsapp: scan the QR code to pair");
            }
            "sent" => {
                debug!(to = payload["to"].as_str().unwrap_or("?"), "whatsapp send confirmed");
            }
            "error" => {
                error!(error = payload["error"].as_str().unwrap_or("unknown"), "whatsapp bridge error");
            }
            _ => {
                debug!(msg_type = msg_type, "whatsapp bridge: unknown frame type");
            }
        }

        Ok(())
    }

    /// Handle an incoming `"message"` frame.
    async fn handle_incoming_message(&self, payload: &Value) {
        // Prefer `pn` (phone-based JID) over `sender` (LID-based JID).
        let raw_sender = payload["pn"]
            .as_str()
            .filter(|s| !s.is_empty())
            .or_else(|| payload["sender"].as_str())
            .unwrap_or("");

        if raw_sender.is_empty() {
            debug!("whatsapp message with no sender, ignoring");
            return;
        }

        // sender_id: phone part before '@'. chat_id: full JID for replies.
        let sender_id = raw_sender.split('@').next().unwrap_or(raw_sender).to_string();
        let chat_id = payload["sender"].as_str().unwrap_or(raw_sender).to_string();

        if !self.is_allowed(&sender_id) {
            warn!(sender = %sender_id, "whatsapp sender not allowed, ignoring");
            return;
        }

        let content = payload["content"].as_str().unwrap_or("").to_string();
        if content.is_empty() {
            debug!("whatsapp empty message, ignoring");
            return;
        }

        let is_group = payload["isGroup"].as_bool().unwrap_or(false);

        debug!(
            sender = %sender_id,
            chat_id = %chat_id,
            is_group = is_group,
            "whatsapp inbound message"
        );

        let mut inbound = InboundMessage::new("whatsapp", &sender_id, &chat_id, &content);
        if let Some(msg_id) = payload["id"].as_str() {
            inbound.metadata.insert("message_ts".into(), json!(msg_id));
        }
        inbound.metadata.insert("is_group".into(), json!(is_group));

        if let Err(e) = self.bus.publish_inbound(inbound).await {
            error!(error = %e, "failed to publish whatsapp message to bus");
        }

        // Show the user we're working on it until the reply is sent.
        self.start_typing(&chat_id).await;
    }
}

#[async_trait]
impl Channel for WhatsAppChannel {
    fn name(&self) -> &str {
        "whatsapp"
    }

    fn is_allowed(&self, sender_id: &str) -> bool {
        allowlist_permits(&self.allowed_users, sender_id)
    }

    async fn start(&self) -> anyhow::Result<()> {
        info!(url = %self.bridge_url, "starting whatsapp channel");
        self.run_bridge_loop().await
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.shutdown.notify_waiters();
        *self.connected.lock().await = false;
        *self.ws_write.lock().await = None;

        let mut tasks = self.typing_tasks.lock().await;
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> anyhow::Result<()> {
        let rendered = render_outbound(&msg.content, self.workspace.as_deref());

        // Typed media frames first.
        for attachment in &rendered.attachments {
            let bytes = match tokio::fs::read(&attachment.path).await {
                Ok(b) => b,
                Err(e) => {
                    warn!(path = %attachment.path.display(), error = %e, "whatsapp: unreadable attachment");
                    continue;
                }
            };
            let data = base64::engine::general_purpose::STANDARD.encode(bytes);
            let mimetype = mime_for(&attachment.path);

            let frame = match attachment.kind {
                AttachmentKind::Image => json!({
                    "type": "send_image",
                    "to": msg.chat_id,
                    "image": data,
                    "caption": attachment.filename,
                    "mimetype": mimetype
                }),
                AttachmentKind::Audio => json!({
                    "type": "send_audio",
                    "to": msg.chat_id,
                    "data": data,
                    "mimetype": mimetype,
                    "filename": attachment.filename
                }),
                AttachmentKind::Video => json!({
                    "type": "send_video",
                    "to": msg.chat_id,
                    "data": data,
                    "mimetype": mimetype,
                    "caption": attachment.filename
                }),
                AttachmentKind::Document => json!({
                    "type": "send_document",
                    "to": msg.chat_id,
                    "data": data,
                    "mimetype": mimetype,
                    "filename": attachment.filename,
                    "caption": attachment.filename
                }),
            };

            if let Err(e) = self.send_frame(frame).await {
                warn!(error = %e, "failed to send whatsapp media frame");
            }
        }

        // Remaining text.
        let result = if rendered.text.is_empty() {
            Ok(())
        } else {
            self.send_frame(json!({
                "type": "send",
                "to": msg.chat_id,
                "text": rendered.text
            }))
            .await
        };

        // Reply is out (or failed): stop the repeater either way.
        self.stop_typing(&msg.chat_id, true).await;

        match result {
            Ok(()) => {
                debug!(chat_id = %msg.chat_id, "whatsapp message sent");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "whatsapp bridge not connected, message dropped");
                Ok(())
            }
        }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn create_test_channel() -> WhatsAppChannel {
        let bus = Arc::new(MessageBus::new(32));
        WhatsAppChannel::new(String::new(), bus, vec![], None)
    }

    fn create_bus_channel() -> (WhatsAppChannel, Arc<MessageBus>) {
        let bus = Arc::new(MessageBus::new(32));
        (WhatsAppChannel::new(String::new(), bus.clone(), vec![], None), bus)
    }

    #[test]
    fn test_channel_name() {
        assert_eq!(create_test_channel().name(), "whatsapp");
    }

    #[test]
    fn test_default_bridge_url() {
        assert_eq!(create_test_channel().bridge_url, "ws://localhost:3001");
    }

    #[test]
    fn test_custom_bridge_url() {
        let bus = Arc::new(MessageBus::new(32));
        let ch = WhatsAppChannel::new("ws://mybridge:9000".into(), bus, vec![], None);
        assert_eq!(ch.bridge_url, "ws://mybridge:9000");
    }

    #[test]
    fn test_is_allowed() {
        let bus = Arc::new(MessageBus::new(32));
        let ch = WhatsAppChannel::new(String::new(), bus, vec!["34612345678".into()], None);
        assert!(ch.is_allowed("34612345678"));
        assert!(!ch.is_allowed("0000000000"));
    }

    #[tokio::test]
    async fn test_status_connected_removes_qr_file() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(MessageBus::new(32));
        let ch = WhatsAppChannel::new(String::new(), bus, vec![], Some(dir.path().to_path_buf()));

        // QR frame writes the pairing file...
        ch.handle_bridge_message(r#"{"type":"qr","qr":"pairing-data"}"#)
            .await
            .unwrap();
        let qr_path = dir.path().join("whatsapp_qr.txt");
        assert_eq!(std::fs::read_to_string(&qr_path).unwrap(), "pairing-data");

        // ...and a connected status removes it.
        ch.handle_bridge_message(r#"{"type":"status","status":"connected"}"#)
            .await
            .unwrap();
        assert!(!qr_path.exists());
        assert!(*ch.connected.lock().await);
    }

    #[tokio::test]
    async fn test_status_disconnected() {
        let ch = create_test_channel();
        ch.handle_bridge_message(r#"{"type":"status","status":"connected"}"#)
            .await
            .unwrap();
        ch.handle_bridge_message(r#"{"type":"status","status":"disconnected"}"#)
            .await
            .unwrap();
        assert!(!*ch.connected.lock().await);
    }

    #[tokio::test]
    async fn test_invalid_json_errors() {
        let ch = create_test_channel();
        assert!(ch.handle_bridge_message("not json").await.is_err());
    }

    #[tokio::test]
    async fn test_incoming_message_publishes() {
        let (ch, bus) = create_bus_channel();

        let payload = json!({
            "type": "message",
            "id": "msg1",
            "sender": "12345@lid",
            "pn": "12345@s.whatsapp.net",
            "content": "hello from whatsapp",
            "isGroup": false
        });

        ch.handle_incoming_message(&payload).await;

        let msg = bus.consume_inbound(Duration::from_millis(200)).await.unwrap();
        assert_eq!(msg.channel, "whatsapp");
        assert_eq!(msg.sender_id, "12345");
        assert_eq!(msg.chat_id, "12345@lid");
        assert_eq!(msg.content, "hello from whatsapp");
        assert_eq!(msg.meta_str("message_ts"), Some("msg1"));

        // A typing repeater is registered for the chat.
        let tasks = ch.typing_tasks.lock().await;
        assert!(tasks.contains_key("12345@lid"));
    }

    #[tokio::test]
    async fn test_incoming_prefers_pn_for_sender_id() {
        let (ch, bus) = create_bus_channel();

        let payload = json!({
            "sender": "lid123@lid",
            "pn": "5551234@s.whatsapp.net",
            "content": "test"
        });

        ch.handle_incoming_message(&payload).await;

        let msg = bus.consume_inbound(Duration::from_millis(200)).await.unwrap();
        assert_eq!(msg.sender_id, "5551234");
        assert_eq!(msg.chat_id, "lid123@lid");
    }

    #[tokio::test]
    async fn test_incoming_empty_content_ignored() {
        let (ch, bus) = create_bus_channel();

        let payload = json!({
            "sender": "12345@s.whatsapp.net",
            "content": ""
        });

        ch.handle_incoming_message(&payload).await;
        assert!(bus.consume_inbound(Duration::from_millis(50)).await.is_none());
    }

    #[tokio::test]
    async fn test_incoming_unauthorized_ignored() {
        let bus = Arc::new(MessageBus::new(32));
        let ch = WhatsAppChannel::new(String::new(), bus.clone(), vec!["777".into()], None);

        let payload = json!({
            "sender": "12345@s.whatsapp.net",
            "content": "hello"
        });

        ch.handle_incoming_message(&payload).await;
        assert!(bus.consume_inbound(Duration::from_millis(50)).await.is_none());
    }

    #[tokio::test]
    async fn test_send_without_connection_drops_gracefully() {
        let ch = create_test_channel();
        let msg = OutboundMessage::new("whatsapp", "12345@lid", "hello");
        assert!(ch.send(&msg).await.is_ok());
    }
}
