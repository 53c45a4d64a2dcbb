//! Memory system — long-term memory and daily notes.
//!
//! The agent's memory is file-based:
//! - **Long-term memory**: `workspace/memory/MEMORY.md`
//! - **Daily notes**: `workspace/memory/YYYY-MM-DD.md`
//!
//! The context builder reads memory on every prompt build (passive read).
//! The agent writes memory via the filesystem tools (active write).

use std::path::{Path, PathBuf};

use chrono::Utc;

/// File-based memory store for the agent.
pub struct MemoryStore {
    memory_dir: PathBuf,
    memory_file: PathBuf,
}

impl MemoryStore {
    /// Create a MemoryStore without touching the filesystem.
    pub fn new(workspace: &Path) -> Self {
        let memory_dir = workspace.join("memory");
        let memory_file = memory_dir.join("MEMORY.md");
        Self {
            memory_dir,
            memory_file,
        }
    }

    /// Read the long-term memory file. Returns empty string if absent.
    pub fn read_long_term(&self) -> String {
        std::fs::read_to_string(&self.memory_file).unwrap_or_default()
    }

    /// Path to today's daily notes file.
    pub fn today_file(&self) -> PathBuf {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        self.memory_dir.join(format!("{today}.md"))
    }

    /// Read today's daily notes. Returns empty string if absent.
    pub fn read_today(&self) -> String {
        std::fs::read_to_string(self.today_file()).unwrap_or_default()
    }

    /// Build the memory context string for the system prompt.
    ///
    /// Returns `None` if no memory exists.
    pub fn get_memory_context(&self) -> Option<String> {
        let mut sections = Vec::new();

        let long_term = self.read_long_term();
        if !long_term.trim().is_empty() {
            sections.push(format!("## Long-term Memory\n\n{long_term}"));
        }

        let today_content = self.read_today();
        if !today_content.trim().is_empty() {
            let today = Utc::now().format("%Y-%m-%d").to_string();
            sections.push(format!("## Today's Notes ({today})\n\n{today_content}"));
        }

        if sections.is_empty() {
            None
        } else {
            Some(format!("# Memory\n\n{}", sections.join("\n\n")))
        }
    }

    /// Path to the memory directory.
    pub fn memory_dir(&self) -> &Path {
        &self.memory_dir
    }

    /// Path to the long-term memory file.
    pub fn memory_file(&self) -> &Path {
        &self.memory_file
    }
}
