//! Channel trait — the contract every chat platform adapter implements.
//!
//! The core stays oblivious to wire protocols: adapters normalize platform
//! events into `InboundMessage`s and render `OutboundMessage`s back out.

use async_trait::async_trait;
use ferrobot_core::bus::types::OutboundMessage;

/// Every chat channel implements this trait.
///
/// The `ChannelManager` holds `Arc<dyn Channel>` and orchestrates
/// start/stop and per-channel outbound draining.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Unique channel name (e.g. "telegram", "slack", "teams", "whatsapp").
    ///
    /// Must match the key used in config and in `OutboundMessage.channel`.
    fn name(&self) -> &str;

    /// Open the platform connection and enter the receive loop, publishing
    /// `InboundMessage`s to the bus. Reconnects on transport errors with
    /// backoff. Does not return until `stop()` is called.
    async fn start(&self) -> anyhow::Result<()>;

    /// Graceful shutdown of connections and background tasks.
    async fn stop(&self) -> anyhow::Result<()>;

    /// Render and transmit an outbound message.
    async fn send(&self, msg: &OutboundMessage) -> anyhow::Result<()>;

    /// Allowlist check, consulted before publishing inbound events.
    fn is_allowed(&self, sender_id: &str) -> bool;
}

/// Shared allowlist matcher.
///
/// An empty list allows everyone. Sender ids of the form `"id|username"`
/// match on either part.
pub fn allowlist_permits(allowed: &[String], sender_id: &str) -> bool {
    if allowed.is_empty() {
        return true;
    }

    if allowed.iter().any(|u| u == sender_id) {
        return true;
    }

    for part in sender_id.split('|') {
        if !part.is_empty() && allowed.iter().any(|u| u == part) {
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_list_allows_everyone() {
        assert!(allowlist_permits(&[], "anyone"));
        assert!(allowlist_permits(&[], "123|user"));
    }

    #[test]
    fn test_exact_match() {
        let allowed = vec!["123456".to_string()];
        assert!(allowlist_permits(&allowed, "123456"));
        assert!(!allowlist_permits(&allowed, "999999"));
    }

    #[test]
    fn test_pipe_parts_match() {
        let allowed = vec!["123456".to_string(), "johndoe".to_string()];
        assert!(allowlist_permits(&allowed, "123456|someuser"));
        assert!(allowlist_permits(&allowed, "999999|johndoe"));
        assert!(!allowlist_permits(&allowed, "999999|stranger"));
    }
}
