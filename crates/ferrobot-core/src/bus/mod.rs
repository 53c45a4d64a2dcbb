//! The in-process message bus: the only synchronization point between
//! channel adapters and the agent loop.

pub mod queue;
pub mod types;

pub use queue::MessageBus;
pub use types::{InboundMessage, OutboundMessage};
