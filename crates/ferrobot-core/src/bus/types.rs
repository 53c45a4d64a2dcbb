//! Bus event types — messages flowing between channels and the agent loop.

use crate::types::MediaAttachment;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

/// An inbound message from a channel to the agent.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    /// Channel name (e.g. "telegram", "slack", "cli", "system").
    pub channel: String,
    /// Stable sender identifier within the channel.
    pub sender_id: String,
    /// Chat/conversation identifier. For `system` messages this is
    /// `"origin_channel:origin_chat_id"` so replies can be routed back.
    pub chat_id: String,
    /// Text content of the message (may embed attachment markers).
    pub content: String,
    /// When the message was received.
    pub timestamp: DateTime<Utc>,
    /// Locally-resolved attachments (photos, voice, documents).
    pub media: Vec<MediaAttachment>,
    /// Channel-specific metadata. Recognized keys: `internal` (bool),
    /// `reply_to`/`thread_ts`/`message_ts` (strings), `session_key_override`.
    pub metadata: HashMap<String, Value>,
}

impl InboundMessage {
    /// Create a new inbound message with minimal required fields.
    pub fn new(
        channel: impl Into<String>,
        sender_id: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        InboundMessage {
            channel: channel.into(),
            sender_id: sender_id.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            timestamp: Utc::now(),
            media: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Session key for history lookup: the `session_key_override` metadata
    /// entry when present, otherwise `"{channel}:{chat_id}"`.
    pub fn session_key(&self) -> String {
        if let Some(key) = self
            .metadata
            .get("session_key_override")
            .and_then(|v| v.as_str())
        {
            return key.to_string();
        }
        format!("{}:{}", self.channel, self.chat_id)
    }

    /// Whether this message is exempt from plan/credit gating.
    pub fn is_internal(&self) -> bool {
        self.metadata
            .get("internal")
            .map(|v| v.as_bool().unwrap_or(v.as_str() == Some("true")))
            .unwrap_or(false)
    }

    /// Metadata entry as a string, if present and string-valued.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

/// An outbound message from the agent to a channel.
#[derive(Clone, Debug)]
pub struct OutboundMessage {
    /// Target channel name. Must name a registered adapter or the bus
    /// drops the message with a warning.
    pub channel: String,
    /// Target chat/conversation identifier.
    pub chat_id: String,
    /// Text content. May embed `[image: path]`, markdown images, or bare
    /// file paths that the channel extracts into typed attachments.
    pub content: String,
    /// Optional message ID to reply to.
    pub reply_to: Option<String>,
    /// Channel-specific metadata (e.g. `thread_ts`).
    pub metadata: HashMap<String, Value>,
}

impl OutboundMessage {
    /// Create a new outbound message.
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        OutboundMessage {
            channel: channel.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            reply_to: None,
            metadata: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_inbound_message_creation() {
        let msg = InboundMessage::new("telegram", "user_42", "chat_99", "Hello Ferrobot!");

        assert_eq!(msg.channel, "telegram");
        assert_eq!(msg.sender_id, "user_42");
        assert_eq!(msg.chat_id, "chat_99");
        assert_eq!(msg.content, "Hello Ferrobot!");
        assert!(msg.media.is_empty());
        assert!(msg.metadata.is_empty());
    }

    #[test]
    fn test_session_key_default() {
        let msg = InboundMessage::new("slack", "user_1", "C123", "test");
        assert_eq!(msg.session_key(), "slack:C123");
    }

    #[test]
    fn test_session_key_override() {
        let mut msg = InboundMessage::new("cli", "user", "direct", "test");
        msg.metadata
            .insert("session_key_override".into(), json!("cron:abc123"));
        assert_eq!(msg.session_key(), "cron:abc123");
    }

    #[test]
    fn test_is_internal_bool() {
        let mut msg = InboundMessage::new("system", "cron", "telegram:42", "tick");
        assert!(!msg.is_internal());
        msg.metadata.insert("internal".into(), json!(true));
        assert!(msg.is_internal());
    }

    #[test]
    fn test_is_internal_string() {
        let mut msg = InboundMessage::new("system", "cron", "telegram:42", "tick");
        msg.metadata.insert("internal".into(), json!("true"));
        assert!(msg.is_internal());
    }

    #[test]
    fn test_meta_str() {
        let mut msg = InboundMessage::new("slack", "U1", "C1", "hi");
        msg.metadata.insert("thread_ts".into(), json!("1700.001"));
        assert_eq!(msg.meta_str("thread_ts"), Some("1700.001"));
        assert_eq!(msg.meta_str("missing"), None);
    }

    #[test]
    fn test_outbound_message_creation() {
        let msg = OutboundMessage::new("telegram", "chat_99", "Here's your answer!");

        assert_eq!(msg.channel, "telegram");
        assert_eq!(msg.chat_id, "chat_99");
        assert_eq!(msg.content, "Here's your answer!");
        assert!(msg.reply_to.is_none());
    }
}
