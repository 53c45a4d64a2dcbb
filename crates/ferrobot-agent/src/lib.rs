//! The agent core: message-driven loop, context building, memory,
//! sub-agent management, and the default tool set.

pub mod agent_loop;
pub mod context;
pub mod credit;
pub mod memory;
pub mod subagent;
pub mod tools;

pub use agent_loop::{AgentLoop, AgentSettings};
pub use context::ContextBuilder;
pub use subagent::SubagentManager;
