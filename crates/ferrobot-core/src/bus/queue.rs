//! Async message bus built on bounded `tokio::sync::mpsc` channels.
//!
//! One inbound queue (channels → agent loop) and one outbound queue per
//! registered channel name (agent loop → that channel's drain task). When a
//! queue is full, `publish_*` awaits — backpressure lands on the producing
//! task rather than dropping messages.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::warn;

use super::types::{InboundMessage, OutboundMessage};

/// One outbound partition: the sender plus its single consumer end.
struct OutboundSlot {
    tx: mpsc::Sender<OutboundMessage>,
    rx: Arc<Mutex<mpsc::Receiver<OutboundMessage>>>,
}

/// The message bus connecting channels ↔ agent loop.
///
/// - Channels publish to `inbound` (user messages arriving)
/// - The agent loop consumes `inbound`, processes, publishes to `outbound`
/// - Each channel drains only its own outbound partition
pub struct MessageBus {
    capacity: usize,
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<mpsc::Receiver<InboundMessage>>,
    outbound: RwLock<HashMap<String, OutboundSlot>>,
}

impl MessageBus {
    /// Create a new message bus with the given per-queue capacity.
    pub fn new(capacity: usize) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        MessageBus {
            capacity,
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            outbound: RwLock::new(HashMap::new()),
        }
    }

    /// Register an outbound partition for a channel adapter.
    ///
    /// Idempotent: re-registering an existing name keeps the old queue.
    pub async fn register_channel(&self, name: &str) {
        let mut map = self.outbound.write().await;
        if !map.contains_key(name) {
            let (tx, rx) = mpsc::channel(self.capacity);
            map.insert(
                name.to_string(),
                OutboundSlot {
                    tx,
                    rx: Arc::new(Mutex::new(rx)),
                },
            );
        }
    }

    /// Registered outbound channel names, sorted.
    pub async fn channel_names(&self) -> Vec<String> {
        let map = self.outbound.read().await;
        let mut names: Vec<String> = map.keys().cloned().collect();
        names.sort();
        names
    }

    /// Publish a message from a channel to the agent (inbound).
    ///
    /// Awaits when the queue is full. Errors only if the bus is shut down.
    pub async fn publish_inbound(
        &self,
        msg: InboundMessage,
    ) -> Result<(), mpsc::error::SendError<InboundMessage>> {
        self.inbound_tx.send(msg).await
    }

    /// Consume the next inbound message, waiting at most `timeout`.
    ///
    /// Returns `None` on timeout (the single consumer uses this to
    /// interlock with its stop flag) or if the bus is closed.
    pub async fn consume_inbound(&self, timeout: Duration) -> Option<InboundMessage> {
        let mut rx = self.inbound_rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(msg) => msg,
            Err(_) => None,
        }
    }

    /// Publish a response from the agent to a channel's partition.
    ///
    /// Messages addressed to an unregistered channel are dropped with a
    /// warning (the invariant is that `channel` names a live adapter).
    pub async fn publish_outbound(&self, msg: OutboundMessage) {
        let tx = {
            let map = self.outbound.read().await;
            map.get(&msg.channel).map(|slot| slot.tx.clone())
        };

        match tx {
            Some(tx) => {
                if let Err(e) = tx.send(msg).await {
                    warn!(error = %e, "outbound partition closed, message dropped");
                }
            }
            None => {
                warn!(
                    channel = %msg.channel,
                    chat_id = %msg.chat_id,
                    "no channel registered for outbound message, dropping"
                );
            }
        }
    }

    /// Consume the next outbound message for `channel`, waiting at most
    /// `timeout`. Returns `None` on timeout or unknown channel.
    pub async fn consume_outbound(&self, channel: &str, timeout: Duration) -> Option<OutboundMessage> {
        let rx = {
            let map = self.outbound.read().await;
            map.get(channel).map(|slot| Arc::clone(&slot.rx))
        }?;

        let mut rx = rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(msg) => msg,
            Err(_) => None,
        }
    }

    /// Get a clone of the inbound sender (for channels and services to use).
    pub fn inbound_sender(&self) -> mpsc::Sender<InboundMessage> {
        self.inbound_tx.clone()
    }
}
