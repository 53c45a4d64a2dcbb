//! Channel manager — lifecycle and outbound routing for all adapters.
//!
//! Each registered channel gets two tasks: its own `start()` receive loop
//! and a drain task over its outbound bus partition.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use ferrobot_core::bus::queue::MessageBus;

use crate::base::Channel;

/// Drain poll interval; interlocks with the shutdown signal.
const DRAIN_POLL: Duration = Duration::from_secs(1);

/// Manages the lifecycle and message routing for all chat channels.
pub struct ChannelManager {
    channels: HashMap<String, Arc<dyn Channel>>,
    bus: Arc<MessageBus>,
    shutdown: Arc<Notify>,
}

impl ChannelManager {
    /// Create a new channel manager.
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self {
            channels: HashMap::new(),
            bus,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Register a channel and its outbound bus partition.
    pub async fn register(&mut self, channel: Arc<dyn Channel>) {
        let name = channel.name().to_string();
        self.bus.register_channel(&name).await;
        info!(channel = %name, "registered channel");
        self.channels.insert(name, channel);
    }

    /// Get a registered channel by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Channel>> {
        self.channels.get(name)
    }

    /// Names of all registered channels, sorted.
    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether there are no registered channels.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Start all channels and their outbound drain tasks.
    ///
    /// Blocks until shutdown is signaled.
    pub async fn start_all(&self) -> Result<()> {
        if self.channels.is_empty() {
            warn!("no channels registered, nothing to start");
            return Ok(());
        }

        info!(
            channels = ?self.channel_names(),
            "starting {} channel(s)",
            self.channels.len()
        );

        let mut handles = Vec::new();

        for (name, channel) in &self.channels {
            // Receive loop.
            let ch = channel.clone();
            let ch_name = name.clone();
            handles.push(tokio::spawn(async move {
                info!(channel = %ch_name, "channel starting");
                if let Err(e) = ch.start().await {
                    error!(channel = %ch_name, error = %e, "channel start failed");
                }
                info!(channel = %ch_name, "channel stopped");
            }));

            // Outbound drain for this channel's partition.
            let ch = channel.clone();
            let bus = self.bus.clone();
            let shutdown = self.shutdown.clone();
            handles.push(tokio::spawn(async move {
                Self::drain_outbound(bus, ch, shutdown).await;
            }));
        }

        self.shutdown.notified().await;

        info!("channel manager shutting down");
        for handle in handles {
            handle.abort();
        }
        Ok(())
    }

    /// Stop all channels and signal the drain tasks.
    pub async fn stop_all(&self) {
        info!("stopping all channels");
        self.shutdown.notify_waiters();

        for (name, channel) in &self.channels {
            debug!(channel = %name, "stopping channel");
            if let Err(e) = channel.stop().await {
                error!(channel = %name, error = %e, "channel stop failed");
            }
        }

        info!("all channels stopped");
    }

    /// Signal the manager to shut down.
    pub fn signal_shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    /// Drain one channel's outbound partition into its `send()`.
    async fn drain_outbound(bus: Arc<MessageBus>, channel: Arc<dyn Channel>, shutdown: Arc<Notify>) {
        let name = channel.name().to_string();
        debug!(channel = %name, "outbound drain started");

        loop {
            tokio::select! {
                msg = bus.consume_outbound(&name, DRAIN_POLL) => {
                    if let Some(outbound) = msg {
                        debug!(
                            channel = %name,
                            chat_id = %outbound.chat_id,
                            content_len = outbound.content.len(),
                            "dispatching outbound message"
                        );
                        if let Err(e) = channel.send(&outbound).await {
                            error!(channel = %name, error = %e, "failed to send outbound message");
                        }
                    }
                }
                _ = shutdown.notified() => {
                    debug!(channel = %name, "drain received shutdown");
                    break;
                }
            }
        }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
